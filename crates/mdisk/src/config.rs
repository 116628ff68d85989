use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MdError, Result};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const MAX_LABEL_LEN: usize = 256;

/// Driver-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Unit numbers are allocated from `0..max_units`.
    pub max_units: u32,
    pub min_sector_size: u32,
    /// Page size used by memory-backed stores. Raised to the sector size when smaller.
    pub page_size: usize,
    /// Largest read or write accepted by the geometry adapter.
    pub max_io_bytes: u64,
    /// Requests allowed to wait in one unit's queue.
    pub max_pending: usize,
    /// Per-unit cap on resident pages for memory-backed stores.
    pub malloc_page_limit: Option<u64>,
    /// Create a read-only unit for every preloaded image at attach.
    pub autoattach_preloaded: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_units: 1024,
            min_sector_size: DEFAULT_SECTOR_SIZE,
            page_size: mdisk_storage::DEFAULT_PAGE_SIZE,
            max_io_bytes: 1024 * 1024,
            max_pending: 4096,
            malloc_page_limit: None,
            autoattach_preloaded: true,
        }
    }
}

impl DriverConfig {
    /// Defaults overlaid with `MDISK_*` environment variables.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_units: parse_env("MDISK_MAX_UNITS").unwrap_or(defaults.max_units),
            min_sector_size: parse_env("MDISK_MIN_SECTOR_SIZE")
                .unwrap_or(defaults.min_sector_size),
            page_size: parse_env("MDISK_PAGE_SIZE").unwrap_or(defaults.page_size),
            max_io_bytes: parse_env("MDISK_MAX_IO_BYTES").unwrap_or(defaults.max_io_bytes),
            max_pending: parse_env("MDISK_MAX_PENDING").unwrap_or(defaults.max_pending),
            malloc_page_limit: parse_env("MDISK_MALLOC_PAGE_LIMIT")
                .or(defaults.malloc_page_limit),
            autoattach_preloaded: parse_env("MDISK_AUTOATTACH_PRELOADED")
                .unwrap_or(defaults.autoattach_preloaded),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_units == 0 {
            return Err(MdError::InvalidConfig("max_units must be > 0".into()));
        }
        if !self.min_sector_size.is_power_of_two() {
            return Err(MdError::InvalidConfig(
                "min_sector_size must be a power of two".into(),
            ));
        }
        if !self.page_size.is_power_of_two() {
            return Err(MdError::InvalidConfig(
                "page_size must be a power of two".into(),
            ));
        }
        if self.max_io_bytes < u64::from(self.min_sector_size) {
            return Err(MdError::InvalidConfig(
                "max_io_bytes must hold at least one sector".into(),
            ));
        }
        if self.max_pending == 0 {
            return Err(MdError::InvalidConfig("max_pending must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

/// Backing medium requested for a new unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackingConfig {
    Malloc,
    Swap,
    Vnode { path: PathBuf },
    Preload { image: String },
    Null,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub read_only: bool,
    /// Allocate all memory up front (malloc only).
    pub reserve: bool,
    /// Keep single-byte-filled pages without a buffer (malloc only).
    pub compress: bool,
    pub removable: bool,
}

/// Structured record describing a unit to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Requested unit number; the smallest free one is used when absent.
    #[serde(default)]
    pub unit: Option<u32>,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    /// Media size in bytes. Vnode and preload units default to the size of their source.
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub backing: BackingConfig,
    #[serde(default)]
    pub options: DeviceOptions,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub fwsectors: u32,
    #[serde(default)]
    pub fwheads: u32,
}

fn default_sector_size() -> u32 {
    DEFAULT_SECTOR_SIZE
}

impl DeviceConfig {
    pub fn new(backing: BackingConfig) -> Self {
        Self {
            unit: None,
            sector_size: DEFAULT_SECTOR_SIZE,
            size_bytes: None,
            backing,
            options: DeviceOptions::default(),
            label: None,
            fwsectors: 0,
            fwheads: 0,
        }
    }

    pub fn malloc(size_bytes: u64) -> Self {
        Self::new(BackingConfig::Malloc).with_size(size_bytes)
    }

    pub fn swap(size_bytes: u64) -> Self {
        Self::new(BackingConfig::Swap).with_size(size_bytes)
    }

    pub fn null(size_bytes: u64) -> Self {
        Self::new(BackingConfig::Null).with_size(size_bytes)
    }

    pub fn vnode(path: impl Into<PathBuf>) -> Self {
        Self::new(BackingConfig::Vnode { path: path.into() })
    }

    pub fn preload(image: impl Into<String>) -> Self {
        Self::new(BackingConfig::Preload {
            image: image.into(),
        })
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_unit(mut self, unit: u32) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_options(mut self, options: DeviceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Checks everything that does not depend on the backing source.
    pub(crate) fn validate(&self, driver: &DriverConfig) -> Result<()> {
        let sector_size = self.sector_size;
        if !sector_size.is_power_of_two() || sector_size < driver.min_sector_size {
            return Err(MdError::InvalidConfig(format!(
                "sector size {sector_size} must be a power of two >= {}",
                driver.min_sector_size
            )));
        }
        if u64::from(sector_size) > driver.max_io_bytes {
            return Err(MdError::InvalidConfig(format!(
                "sector size {sector_size} exceeds max_io_bytes {}",
                driver.max_io_bytes
            )));
        }
        if let Some(size) = self.size_bytes {
            check_media_size(size, sector_size)?;
        }
        let malloc = matches!(self.backing, BackingConfig::Malloc);
        if (self.options.reserve || self.options.compress) && !malloc {
            return Err(MdError::InvalidConfig(
                "reserve and compress only apply to malloc units".into(),
            ));
        }
        if self.options.reserve && self.options.compress {
            return Err(MdError::InvalidConfig(
                "reserve and compress are mutually exclusive".into(),
            ));
        }
        match &self.backing {
            BackingConfig::Malloc | BackingConfig::Swap | BackingConfig::Null => {
                if self.size_bytes.is_none() {
                    return Err(MdError::InvalidConfig(
                        "size is required for this backing type".into(),
                    ));
                }
            }
            BackingConfig::Vnode { path } => {
                if path.as_os_str().is_empty() {
                    return Err(MdError::InvalidConfig("vnode path is empty".into()));
                }
            }
            BackingConfig::Preload { image } => {
                if image.is_empty() {
                    return Err(MdError::InvalidConfig("preload image name is empty".into()));
                }
            }
        }
        if let Some(label) = &self.label {
            if label.len() > MAX_LABEL_LEN {
                return Err(MdError::InvalidConfig(format!(
                    "label longer than {MAX_LABEL_LEN} bytes"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn check_media_size(size: u64, sector_size: u32) -> Result<()> {
    if size == 0 || size % u64::from(sector_size) != 0 {
        return Err(MdError::InvalidConfig(format!(
            "size {size} must be a positive multiple of the sector size {sector_size}"
        )));
    }
    Ok(())
}

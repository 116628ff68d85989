use std::sync::{Arc, Mutex, MutexGuard};

use mdisk_storage::{
    BackingStore, MemoryConfig, MemoryStore, NullStore, Pager, PreloadStore, SwapStore,
    VnodeStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{check_media_size, BackingConfig, DeviceConfig, DeviceOptions, DriverConfig};
use crate::device::{DeviceInstance, DeviceState, DeviceSummary};
use crate::geom::{GeomHost, MdProvider};
use crate::host::{Collaborators, PreloadImage, VnodeOpener};
use crate::queue;
use crate::registry::Registry;
use crate::{errno, MdError, Result};

/// Structured control record, the in-process form of the md control ioctl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MdControl {
    Attach(DeviceConfig),
    Resize {
        unit: u32,
        sectors: u64,
    },
    Detach {
        unit: u32,
        #[serde(default)]
        force: bool,
    },
    List,
    Query {
        unit: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MdReply {
    Attached { unit: u32 },
    Resized { unit: u32, sectors: u64 },
    Detached { unit: u32 },
    Units(Vec<DeviceSummary>),
    Unit(DeviceSummary),
}

/// The driver: registry of units plus the collaborators they are built from.
///
/// Every registry mutation and every listing happens under one lock, so a half-built unit
/// is never observable. Store resizes and worker joins run outside it.
#[derive(Debug)]
pub struct MdDriver {
    config: DriverConfig,
    host: Arc<dyn GeomHost>,
    pager: Arc<dyn Pager>,
    vnodes: Arc<dyn VnodeOpener>,
    preloaded: Vec<PreloadImage>,
    registry: Mutex<Registry>,
}

impl MdDriver {
    /// Brings the driver up and, if configured, creates a read-only unit per preloaded image.
    pub fn attach(config: DriverConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            host,
            pager,
            vnodes,
            preloaded,
        } = collaborators;
        let driver = Self {
            config,
            host,
            pager,
            vnodes,
            preloaded,
            registry: Mutex::new(Registry::default()),
        };
        if driver.config.autoattach_preloaded {
            for image in &driver.preloaded {
                let cfg = DeviceConfig::preload(image.name.clone())
                    .with_sector_size(image.sector_size)
                    .with_options(DeviceOptions {
                        read_only: true,
                        ..DeviceOptions::default()
                    });
                if let Err(err) = driver.create(cfg) {
                    warn!(image = %image.name, error = %err, "preloaded image not attached");
                }
            }
        }
        info!(units = driver.registry().len(), "driver attached");
        Ok(driver)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Creates and activates a unit. On error nothing is registered.
    pub fn create(&self, cfg: DeviceConfig) -> Result<u32> {
        cfg.validate(&self.config)?;

        let mut registry = self.registry();
        let unit = registry.allocate_unit(cfg.unit, self.config.max_units)?;
        let store = self.build_store(&cfg)?;
        let device = Arc::new(DeviceInstance::new(
            unit,
            &cfg,
            store,
            self.config.max_pending,
        ));

        let handle = queue::spawn_worker(Arc::clone(&device)).map_err(|err| {
            warn!(unit, error = %err, "cannot start worker");
            MdError::OutOfResources
        })?;
        device.set_worker(handle);

        if let Err(err) = self.host.new_provider(&MdProvider::info(&device)) {
            warn!(unit, error = %err, "provider registration failed");
            // Nothing can have opened a unit that was never activated.
            let _ = device.begin_detach(true);
            device.join_worker();
            return Err(err);
        }

        device.activate();
        registry.insert(Arc::clone(&device));
        info!(
            unit,
            kind = %device.kind(),
            media_size = device.media_size(),
            sector_size = device.sector_size(),
            "created md{unit}"
        );
        Ok(unit)
    }

    fn build_store(&self, cfg: &DeviceConfig) -> Result<BackingStore> {
        let sector_size = u64::from(cfg.sector_size);
        let read_only = cfg.options.read_only;
        let store = match &cfg.backing {
            BackingConfig::Malloc => {
                let mut mem = MemoryConfig::new(required_size(cfg)?);
                mem.page_size = self.config.page_size.max(cfg.sector_size as usize);
                mem.reserve = cfg.options.reserve;
                mem.compress = cfg.options.compress;
                mem.max_pages = self.config.malloc_page_limit;
                BackingStore::Malloc(MemoryStore::new(mem)?)
            }
            BackingConfig::Swap => {
                BackingStore::Swap(SwapStore::new(Arc::clone(&self.pager), required_size(cfg)?)?)
            }
            BackingConfig::Null => BackingStore::Null(NullStore::new(required_size(cfg)?)),
            BackingConfig::Vnode { path } => {
                let vnode = self.vnodes.open(path, read_only).map_err(|err| {
                    MdError::InvalidConfig(format!("cannot open {}: {err}", path.display()))
                })?;
                let len = match cfg.size_bytes {
                    Some(len) => len,
                    None => {
                        let file_len = vnode.len().map_err(|err| {
                            MdError::InvalidConfig(format!("cannot stat {}: {err}", path.display()))
                        })?;
                        file_len - file_len % sector_size
                    }
                };
                check_media_size(len, cfg.sector_size)?;
                BackingStore::Vnode(VnodeStore::new(vnode, len, read_only)?)
            }
            BackingConfig::Preload { image } => {
                let image = self
                    .preloaded
                    .iter()
                    .find(|candidate| candidate.name == *image)
                    .ok_or_else(|| MdError::InvalidConfig(format!("no preloaded image {image:?}")))?;
                let len = cfg.size_bytes.unwrap_or(image.data.len() as u64);
                check_media_size(len, cfg.sector_size)?;
                BackingStore::Preload(PreloadStore::new(Arc::clone(&image.data), len)?)
            }
        };
        Ok(store)
    }

    /// Changes a unit's size to `sector_count` sectors.
    pub fn resize(&self, unit: u32, sector_count: u64) -> Result<()> {
        if sector_count == 0 {
            return Err(MdError::InvalidConfig("cannot resize to zero sectors".into()));
        }
        let device = {
            let registry = self.registry();
            let device = registry.get(unit).ok_or(MdError::NotFound(unit))?;
            if device.state() != DeviceState::Active {
                return Err(MdError::Busy {
                    unit,
                    reason: "detach in progress",
                });
            }
            if !device.supports_resize() {
                return Err(MdError::Unsupported("backing store cannot be resized"));
            }
            if !device.try_begin_resize() {
                return Err(MdError::Busy {
                    unit,
                    reason: "resize in progress",
                });
            }
            Arc::clone(device)
        };

        let old_media_size = device.media_size();
        let result = device.resize(sector_count);
        if result.is_ok() {
            self.host.resize_provider(unit, device.media_size());
        }
        device.end_resize();
        result?;
        info!(unit, from = old_media_size, to = device.media_size(), "resized md{unit}");
        Ok(())
    }

    /// Removes a unit after draining its queue.
    ///
    /// Open references make this `Busy` unless `force` is set, in which case they are
    /// invalidated and their holders see ENXIO.
    pub fn detach(&self, unit: u32, force: bool) -> Result<()> {
        let device = {
            let mut registry = self.registry();
            let device = registry.get(unit).ok_or(MdError::NotFound(unit))?;
            if device.is_resizing() {
                return Err(MdError::Busy {
                    unit,
                    reason: "resize in progress",
                });
            }
            let open = device.begin_detach(force)?;
            if open.is_open() {
                warn!(unit, r = open.r, w = open.w, e = open.e, "forced detach of open device");
            }
            registry.remove(unit).ok_or(MdError::NotFound(unit))?
        };

        self.host.wither_provider(unit, errno::ENXIO);
        device.join_worker();
        info!(unit, "detached md{unit}");
        Ok(())
    }

    /// Snapshot of every unit, ordered by unit number.
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.registry().iter().map(|device| device.summary()).collect()
    }

    pub fn query(&self, unit: u32) -> Result<DeviceSummary> {
        self.registry()
            .get(unit)
            .map(|device| device.summary())
            .ok_or(MdError::NotFound(unit))
    }

    pub fn device(&self, unit: u32) -> Option<Arc<DeviceInstance>> {
        self.registry().get(unit).cloned()
    }

    /// The framework-facing handle of `unit`.
    pub fn provider(&self, unit: u32) -> Option<MdProvider> {
        self.device(unit)
            .map(|device| MdProvider::new(device, self.config.max_io_bytes))
    }

    pub fn ioctl(&self, control: MdControl) -> Result<MdReply> {
        match control {
            MdControl::Attach(cfg) => self.create(cfg).map(|unit| MdReply::Attached { unit }),
            MdControl::Resize { unit, sectors } => self
                .resize(unit, sectors)
                .map(|()| MdReply::Resized { unit, sectors }),
            MdControl::Detach { unit, force } => {
                self.detach(unit, force).map(|()| MdReply::Detached { unit })
            }
            MdControl::List => Ok(MdReply::Units(self.list())),
            MdControl::Query { unit } => self.query(unit).map(MdReply::Unit),
        }
    }

    /// JSON form of [`MdDriver::ioctl`].
    ///
    /// Replies are `{"ok": reply}` or `{"error": {"errno": n, "message": text}}`.
    pub fn control_json(&self, input: &str) -> String {
        let reply = match serde_json::from_str::<MdControl>(input) {
            Ok(control) => match self.ioctl(control) {
                Ok(reply) => match serde_json::to_value(&reply) {
                    Ok(value) => json!({ "ok": value }),
                    Err(err) => error_value(errno::EIO, &err.to_string()),
                },
                Err(err) => error_value(err.errno(), &err.to_string()),
            },
            Err(err) => error_value(errno::EINVAL, &format!("malformed control record: {err}")),
        };
        reply.to_string()
    }

    /// Force-detaches every unit.
    pub fn shutdown(&self) {
        let units = self.registry().units();
        for unit in units {
            match self.detach(unit, true) {
                Ok(()) | Err(MdError::NotFound(_)) => {}
                Err(err) => warn!(unit, error = %err, "unit left attached at shutdown"),
            }
        }
    }
}

impl Drop for MdDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn required_size(cfg: &DeviceConfig) -> Result<u64> {
    cfg.size_bytes
        .ok_or_else(|| MdError::InvalidConfig("size is required for this backing type".into()))
}

fn error_value(errno: i32, message: &str) -> Value {
    json!({ "error": { "errno": errno, "message": message } })
}

//! Capabilities the driver borrows from its host: disk framework, paging, file access, and
//! boot-time images.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use mdisk_storage::{MemPager, Pager, StdFileVnode, Vnode, DEFAULT_PAGE_SIZE};

use crate::geom::{GeomHost, LocalGeomHost};

/// Opens the files behind vnode units.
pub trait VnodeOpener: Send + Sync + fmt::Debug {
    fn open(&self, path: &Path, read_only: bool) -> io::Result<Box<dyn Vnode>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdVnodeOpener;

impl VnodeOpener for StdVnodeOpener {
    fn open(&self, path: &Path, read_only: bool) -> io::Result<Box<dyn Vnode>> {
        Ok(Box::new(StdFileVnode::open(path, read_only)?))
    }
}

/// A disk image handed to the driver at attach time.
#[derive(Clone)]
pub struct PreloadImage {
    pub name: String,
    pub data: Arc<[u8]>,
    pub sector_size: u32,
}

impl PreloadImage {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            sector_size: crate::config::DEFAULT_SECTOR_SIZE,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }
}

impl fmt::Debug for PreloadImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadImage")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("sector_size", &self.sector_size)
            .finish()
    }
}

/// Everything [`crate::MdDriver::attach`] wires into the driver.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub host: Arc<dyn GeomHost>,
    /// Shared by every swap-backed unit.
    pub pager: Arc<dyn Pager>,
    pub vnodes: Arc<dyn VnodeOpener>,
    pub preloaded: Vec<PreloadImage>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            host: Arc::new(LocalGeomHost::default()),
            pager: Arc::new(MemPager::new(DEFAULT_PAGE_SIZE)),
            vnodes: Arc::new(StdVnodeOpener),
            preloaded: Vec::new(),
        }
    }
}

impl Collaborators {
    pub fn with_host(mut self, host: Arc<dyn GeomHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_pager(mut self, pager: Arc<dyn Pager>) -> Self {
        self.pager = pager;
        self
    }

    pub fn with_vnodes(mut self, vnodes: Arc<dyn VnodeOpener>) -> Self {
        self.vnodes = vnodes;
        self
    }

    pub fn with_preloaded(mut self, image: PreloadImage) -> Self {
        self.preloaded.push(image);
        self
    }
}

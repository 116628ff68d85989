use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fileio;
use crate::util::checked_range;
use crate::{Result, StoreError};

/// File access capability used by [`VnodeStore`].
///
/// Implementations are free to block. `read_at` may return fewer bytes than requested only at
/// end-of-file.
pub trait Vnode: Send + fmt::Debug {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// [`Vnode`] over a `std::fs::File`.
#[derive(Debug)]
pub struct StdFileVnode {
    file: File,
    path: Option<PathBuf>,
}

impl StdFileVnode {
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn from_file(file: File) -> Self {
        Self { file, path: None }
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl Vnode for StdFileVnode {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        fileio::read_full_at(&self.file, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        fileio::write_all_at(&self.file, offset, buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Store that forwards every access to a file.
///
/// Durability is whatever the file provides; `flush` maps to `sync`.
pub struct VnodeStore {
    vnode: Box<dyn Vnode>,
    len: u64,
    read_only: bool,
}

impl fmt::Debug for VnodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VnodeStore")
            .field("vnode", &self.vnode)
            .field("len", &self.len)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl VnodeStore {
    /// Binds `len` bytes of `vnode`.
    ///
    /// A writable file shorter than `len` is extended; a read-only one is rejected.
    pub fn new(mut vnode: Box<dyn Vnode>, len: u64, read_only: bool) -> Result<Self> {
        let file_len = vnode.len().map_err(StoreError::io("stat"))?;
        if file_len < len {
            if read_only {
                return Err(StoreError::InvalidConfig(
                    "read-only file is smaller than the device",
                ));
            }
            debug!(path = ?vnode.path(), from = file_len, to = len, "extending backing file");
            vnode.set_len(len).map_err(StoreError::io("truncate"))?;
        }
        Ok(Self {
            vnode,
            len,
            read_only,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.vnode.path()
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len() as u64, self.len)?;
        let n = self
            .vnode
            .read_at(offset, buf)
            .map_err(StoreError::io("read"))?;
        // The file may have been truncated behind our back.
        buf[n..].fill(0);
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        checked_range(offset, buf.len() as u64, self.len)?;
        self.vnode
            .write_at(offset, buf)
            .map_err(StoreError::io("write"))?;
        Ok(buf.len())
    }

    pub fn trim(&mut self, offset: u64, len: u64) -> Result<()> {
        checked_range(offset, len, self.len)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.vnode.sync().map_err(StoreError::io("sync"))
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        if self.read_only {
            return Err(StoreError::Unsupported("resize of a read-only file"));
        }
        self.vnode
            .set_len(new_len)
            .map_err(StoreError::io("truncate"))?;
        self.len = new_len;
        Ok(())
    }
}

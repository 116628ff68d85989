use std::fmt;
use std::path::Path;

use crate::{MemoryStore, NullStore, PreloadStore, Result, SwapStore, VnodeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Malloc,
    Swap,
    Vnode,
    Preload,
    Null,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Malloc => "malloc",
            StoreKind::Swap => "swap",
            StoreKind::Vnode => "vnode",
            StoreKind::Preload => "preload",
            StoreKind::Null => "null",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The storage substrate of one device.
///
/// All offsets and lengths are in bytes. Callers are expected to submit sector-aligned,
/// in-range requests; every variant still rejects out-of-range access with
/// [`crate::StoreError::OutOfBounds`].
#[derive(Debug)]
pub enum BackingStore {
    Malloc(MemoryStore),
    Swap(SwapStore),
    Vnode(VnodeStore),
    Preload(PreloadStore),
    Null(NullStore),
}

impl BackingStore {
    pub fn kind(&self) -> StoreKind {
        match self {
            BackingStore::Malloc(_) => StoreKind::Malloc,
            BackingStore::Swap(_) => StoreKind::Swap,
            BackingStore::Vnode(_) => StoreKind::Vnode,
            BackingStore::Preload(_) => StoreKind::Preload,
            BackingStore::Null(_) => StoreKind::Null,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            BackingStore::Malloc(s) => s.len(),
            BackingStore::Swap(s) => s.len(),
            BackingStore::Vnode(s) => s.len(),
            BackingStore::Preload(s) => s.len(),
            BackingStore::Null(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            BackingStore::Vnode(s) => s.is_read_only(),
            BackingStore::Preload(_) => true,
            BackingStore::Malloc(_) | BackingStore::Swap(_) | BackingStore::Null(_) => false,
        }
    }

    pub fn supports_resize(&self) -> bool {
        match self {
            BackingStore::Vnode(s) => !s.is_read_only(),
            BackingStore::Preload(_) => false,
            BackingStore::Malloc(_) | BackingStore::Swap(_) | BackingStore::Null(_) => true,
        }
    }

    /// Whether `trim` can actually reclaim storage.
    pub fn can_delete(&self) -> bool {
        matches!(self, BackingStore::Malloc(_) | BackingStore::Swap(_))
    }

    /// Memory committed to holding data, for stores that allocate it.
    pub fn allocated_bytes(&self) -> Option<u64> {
        match self {
            BackingStore::Malloc(s) => Some(s.allocated_bytes()),
            BackingStore::Swap(s) => Some(s.resident_pages() * s.page_size() as u64),
            BackingStore::Vnode(_) | BackingStore::Preload(_) | BackingStore::Null(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            BackingStore::Vnode(s) => s.path(),
            _ => None,
        }
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            BackingStore::Malloc(s) => s.read_at(offset, buf),
            BackingStore::Swap(s) => s.read_at(offset, buf),
            BackingStore::Vnode(s) => s.read_at(offset, buf),
            BackingStore::Preload(s) => s.read_at(offset, buf),
            BackingStore::Null(s) => s.read_at(offset, buf),
        }
    }

    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = crate::util::try_alloc_zeroed(len)?;
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        match self {
            BackingStore::Malloc(s) => s.write_at(offset, buf),
            BackingStore::Swap(s) => s.write_at(offset, buf),
            BackingStore::Vnode(s) => s.write_at(offset, buf),
            BackingStore::Preload(s) => s.write_at(offset, buf),
            BackingStore::Null(s) => s.write_at(offset, buf),
        }
    }

    pub fn trim(&mut self, offset: u64, len: u64) -> Result<()> {
        let capacity = self.len();
        match self {
            BackingStore::Malloc(s) => s.trim(offset, len),
            BackingStore::Swap(s) => s.trim(offset, len),
            BackingStore::Vnode(s) => s.trim(offset, len),
            BackingStore::Preload(_) | BackingStore::Null(_) => {
                crate::util::checked_range(offset, len, capacity)
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            BackingStore::Vnode(s) => s.flush(),
            BackingStore::Malloc(_)
            | BackingStore::Swap(_)
            | BackingStore::Preload(_)
            | BackingStore::Null(_) => Ok(()),
        }
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        match self {
            BackingStore::Malloc(s) => s.resize(new_len),
            BackingStore::Swap(s) => s.resize(new_len),
            BackingStore::Vnode(s) => s.resize(new_len),
            BackingStore::Preload(s) => s.resize(new_len),
            BackingStore::Null(s) => s.resize(new_len),
        }
    }
}

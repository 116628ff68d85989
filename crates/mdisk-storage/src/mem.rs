use std::collections::BTreeMap;

use crate::util::{checked_range, page_chunks, page_count, try_alloc_zeroed, uniform_byte};
use crate::{Result, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub len: u64,
    pub page_size: usize,
    /// Allocate every page up front instead of on first write.
    pub reserve: bool,
    /// Store pages filled with a single repeated byte without a buffer.
    pub compress: bool,
    /// Upper bound on pages holding a buffer. `None` means only the allocator limits growth.
    pub max_pages: Option<u64>,
}

impl MemoryConfig {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            page_size: DEFAULT_PAGE_SIZE,
            reserve: false,
            compress: false,
            max_pages: None,
        }
    }
}

enum Page {
    Data(Box<[u8]>),
    Uniform(u8),
}

/// Sparse in-memory store.
///
/// Pages are allocated on first write. Reading a page that was never written returns zeros
/// and allocates nothing, so a large device only commits memory for the regions in use.
pub struct MemoryStore {
    len: u64,
    page_size: usize,
    reserve: bool,
    compress: bool,
    max_pages: Option<u64>,
    pages: BTreeMap<u64, Page>,
    data_pages: u64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len)
            .field("page_size", &self.page_size)
            .field("reserve", &self.reserve)
            .field("compress", &self.compress)
            .field("data_pages", &self.data_pages)
            .field("uniform_pages", &self.uniform_pages())
            .finish()
    }
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        if config.page_size == 0 || !config.page_size.is_power_of_two() {
            return Err(StoreError::InvalidConfig("page size must be a power of two"));
        }
        if config.reserve && config.compress {
            return Err(StoreError::InvalidConfig(
                "reserve and compress are mutually exclusive",
            ));
        }
        let mut store = Self {
            len: config.len,
            page_size: config.page_size,
            reserve: config.reserve,
            compress: config.compress,
            max_pages: config.max_pages,
            pages: BTreeMap::new(),
            data_pages: 0,
        };
        if store.reserve {
            store.reserve_pages(0, page_count(store.len, store.page_size))?;
        }
        Ok(store)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_reserved(&self) -> bool {
        self.reserve
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Pages currently holding a buffer.
    pub fn resident_pages(&self) -> u64 {
        self.data_pages
    }

    pub fn uniform_pages(&self) -> u64 {
        self.pages.len() as u64 - self.data_pages
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.data_pages * self.page_size as u64
    }

    fn alloc_page(&mut self, fill: u8) -> Result<Box<[u8]>> {
        if let Some(max) = self.max_pages {
            if self.data_pages >= max {
                return Err(StoreError::OutOfResources);
            }
        }
        let mut data = try_alloc_zeroed(self.page_size)?;
        if fill != 0 {
            data.fill(fill);
        }
        self.data_pages += 1;
        Ok(data.into_boxed_slice())
    }

    fn reserve_pages(&mut self, first: u64, end: u64) -> Result<()> {
        for idx in first..end {
            if self.pages.contains_key(&idx) {
                continue;
            }
            match self.alloc_page(0) {
                Ok(data) => {
                    self.pages.insert(idx, Page::Data(data));
                }
                Err(e) => {
                    // Leave the store exactly as big as it was.
                    for undo in first..idx {
                        self.remove_page(undo);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn remove_page(&mut self, idx: u64) {
        if let Some(Page::Data(_)) = self.pages.remove(&idx) {
            self.data_pages -= 1;
        }
    }

    /// Returns a mutable buffer for `idx`, allocating or expanding a uniform page as needed.
    fn page_data_mut(&mut self, idx: u64) -> Result<&mut [u8]> {
        let fill = match self.pages.get(&idx) {
            Some(Page::Data(_)) => None,
            Some(Page::Uniform(b)) => Some(*b),
            None => Some(0),
        };
        if let Some(fill) = fill {
            let data = self.alloc_page(fill)?;
            if let Some(Page::Data(_)) = self.pages.insert(idx, Page::Data(data)) {
                self.data_pages -= 1;
            }
        }
        match self.pages.get_mut(&idx) {
            Some(Page::Data(data)) => Ok(&mut data[..]),
            _ => Err(StoreError::OutOfResources),
        }
    }

    /// Collapses a page into its compact form if it became uniform.
    fn compact_page(&mut self, idx: u64) {
        if !self.compress {
            return;
        }
        let fill = match self.pages.get(&idx) {
            Some(Page::Data(data)) => uniform_byte(data),
            _ => None,
        };
        if let Some(fill) = fill {
            self.store_uniform(idx, fill);
        }
    }

    fn store_uniform(&mut self, idx: u64, fill: u8) {
        let old = if fill == 0 {
            self.pages.remove(&idx)
        } else {
            self.pages.insert(idx, Page::Uniform(fill))
        };
        if let Some(Page::Data(_)) = old {
            self.data_pages -= 1;
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len() as u64, self.len)?;
        for chunk in page_chunks(offset, buf.len() as u64, self.page_size) {
            let dst = &mut buf[chunk.buf_range()];
            match self.pages.get(&chunk.page) {
                Some(Page::Data(data)) => dst.copy_from_slice(&data[chunk.page_range()]),
                Some(Page::Uniform(fill)) => dst.fill(*fill),
                None => dst.fill(0),
            }
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        checked_range(offset, buf.len() as u64, self.len)?;
        for chunk in page_chunks(offset, buf.len() as u64, self.page_size) {
            let src = &buf[chunk.buf_range()];
            if self.compress && chunk.is_full_page(self.page_size) {
                if let Some(fill) = uniform_byte(src) {
                    self.store_uniform(chunk.page, fill);
                    continue;
                }
            }
            let data = self.page_data_mut(chunk.page)?;
            data[chunk.page_range()].copy_from_slice(src);
            self.compact_page(chunk.page);
        }
        Ok(buf.len())
    }

    /// Releases whole pages inside the range and zeroes partially covered ones.
    ///
    /// Reserved stores keep their pages and zero them instead.
    pub fn trim(&mut self, offset: u64, len: u64) -> Result<()> {
        checked_range(offset, len, self.len)?;
        for chunk in page_chunks(offset, len, self.page_size) {
            if chunk.is_full_page(self.page_size) && !self.reserve {
                self.remove_page(chunk.page);
                continue;
            }
            let already_zero = matches!(self.pages.get(&chunk.page), None | Some(Page::Uniform(0)));
            if !already_zero {
                self.page_data_mut(chunk.page)?[chunk.page_range()].fill(0);
                self.compact_page(chunk.page);
            }
        }
        Ok(())
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        let old_pages = page_count(self.len, self.page_size);
        let new_pages = page_count(new_len, self.page_size);
        if new_len < self.len {
            let tail_page = new_len / self.page_size as u64;
            let within = (new_len % self.page_size as u64) as usize;
            if within != 0 && self.pages.contains_key(&tail_page) {
                let data = self.page_data_mut(tail_page)?;
                data[within..].fill(0);
                self.compact_page(tail_page);
            }
            let dropped = self.pages.split_off(&new_pages);
            let dropped_data = dropped
                .values()
                .filter(|p| matches!(p, Page::Data(_)))
                .count() as u64;
            self.data_pages -= dropped_data;
        } else if self.reserve && new_pages > old_pages {
            self.reserve_pages(old_pages, new_pages)?;
        }
        self.len = new_len;
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fileio;
use crate::util::{checked_range, page_chunks, try_alloc_zeroed};
use crate::{Result, StoreError};

/// Opaque slot handed out by a [`Pager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle(pub u64);

/// Paging capability backing a [`SwapStore`].
///
/// Contents of a freshly allocated page are unspecified; the store always writes a whole page
/// before reading it back. Buffers passed to `read_page`/`write_page` are exactly
/// [`Pager::page_size`] bytes.
pub trait Pager: Send + Sync + fmt::Debug {
    fn page_size(&self) -> usize;
    fn allocate(&self) -> Result<PageHandle>;
    fn free(&self, handle: PageHandle);
    fn read_page(&self, handle: PageHandle, buf: &mut [u8]) -> Result<()>;
    fn write_page(&self, handle: PageHandle, buf: &[u8]) -> Result<()>;
    fn pages_in_use(&self) -> u64;
}

fn unallocated(op: &'static str, handle: PageHandle) -> StoreError {
    StoreError::BackingIo {
        op,
        source: io::Error::new(io::ErrorKind::NotFound, format!("page {} is not allocated", handle.0)),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct SlotTable {
    next: u64,
    free: Vec<u64>,
    in_use: u64,
}

impl SlotTable {
    fn take(&mut self, limit: Option<u64>) -> Result<u64> {
        if limit.is_some_and(|max| self.in_use >= max) {
            return Err(StoreError::OutOfResources);
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.next;
                self.next += 1;
                slot
            }
        };
        self.in_use += 1;
        Ok(slot)
    }

    fn give_back(&mut self, slot: u64) {
        self.in_use = self.in_use.saturating_sub(1);
        self.free.push(slot);
    }
}

/// In-process pager with an optional slot limit.
#[derive(Debug)]
pub struct MemPager {
    page_size: usize,
    limit: Option<u64>,
    inner: Mutex<MemPagerInner>,
}

#[derive(Debug, Default)]
struct MemPagerInner {
    table: SlotTable,
    slots: BTreeMap<u64, Box<[u8]>>,
}

impl MemPager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            limit: None,
            inner: Mutex::new(MemPagerInner::default()),
        }
    }

    pub fn with_limit(page_size: usize, max_pages: u64) -> Self {
        Self {
            limit: Some(max_pages),
            ..Self::new(page_size)
        }
    }
}

impl Pager for MemPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<PageHandle> {
        let mut inner = lock(&self.inner);
        let slot = inner.table.take(self.limit)?;
        match try_alloc_zeroed(self.page_size) {
            Ok(data) => {
                inner.slots.insert(slot, data.into_boxed_slice());
                Ok(PageHandle(slot))
            }
            Err(e) => {
                inner.table.give_back(slot);
                Err(e)
            }
        }
    }

    fn free(&self, handle: PageHandle) {
        let mut inner = lock(&self.inner);
        if inner.slots.remove(&handle.0).is_some() {
            inner.table.give_back(handle.0);
        }
    }

    fn read_page(&self, handle: PageHandle, buf: &mut [u8]) -> Result<()> {
        let inner = lock(&self.inner);
        let page = inner
            .slots
            .get(&handle.0)
            .ok_or_else(|| unallocated("page in", handle))?;
        buf.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&self, handle: PageHandle, buf: &[u8]) -> Result<()> {
        let mut inner = lock(&self.inner);
        let page = inner
            .slots
            .get_mut(&handle.0)
            .ok_or_else(|| unallocated("page out", handle))?;
        page.copy_from_slice(buf);
        Ok(())
    }

    fn pages_in_use(&self) -> u64 {
        lock(&self.inner).table.in_use
    }
}

/// Pager that keeps pages in slots of a swap file.
#[derive(Debug)]
pub struct FilePager {
    file: File,
    page_size: usize,
    limit: Option<u64>,
    table: Mutex<SlotTable>,
}

impl FilePager {
    pub fn new(file: File, page_size: usize, max_pages: Option<u64>) -> Self {
        Self {
            file,
            page_size,
            limit: max_pages,
            table: Mutex::new(SlotTable::default()),
        }
    }

    fn slot_offset(&self, handle: PageHandle) -> Result<u64> {
        handle
            .0
            .checked_mul(self.page_size as u64)
            .ok_or(StoreError::OffsetOverflow)
    }
}

impl Pager for FilePager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> Result<PageHandle> {
        let slot = lock(&self.table).take(self.limit)?;
        Ok(PageHandle(slot))
    }

    fn free(&self, handle: PageHandle) {
        lock(&self.table).give_back(handle.0);
    }

    fn read_page(&self, handle: PageHandle, buf: &mut [u8]) -> Result<()> {
        let offset = self.slot_offset(handle)?;
        let n = fileio::read_full_at(&self.file, offset, buf).map_err(StoreError::io("page in"))?;
        buf[n..].fill(0);
        Ok(())
    }

    fn write_page(&self, handle: PageHandle, buf: &[u8]) -> Result<()> {
        let offset = self.slot_offset(handle)?;
        fileio::write_all_at(&self.file, offset, buf).map_err(StoreError::io("page out"))
    }

    fn pages_in_use(&self) -> u64 {
        lock(&self.table).in_use
    }
}

/// Store whose pages live in a [`Pager`].
///
/// Only page handles are kept here; the pager decides where the data lives.
pub struct SwapStore {
    pager: Arc<dyn Pager>,
    page_size: usize,
    len: u64,
    pages: BTreeMap<u64, PageHandle>,
}

impl fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapStore")
            .field("page_size", &self.page_size)
            .field("len", &self.len)
            .field("resident_pages", &self.pages.len())
            .finish()
    }
}

impl SwapStore {
    pub fn new(pager: Arc<dyn Pager>, len: u64) -> Result<Self> {
        let page_size = pager.page_size();
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(StoreError::InvalidConfig(
                "pager page size must be a power of two",
            ));
        }
        Ok(Self {
            pager,
            page_size,
            len,
            pages: BTreeMap::new(),
        })
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

    pub fn resident_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    fn load_page(&self, handle: Option<PageHandle>) -> Result<Vec<u8>> {
        let mut page = try_alloc_zeroed(self.page_size)?;
        if let Some(handle) = handle {
            self.pager.read_page(handle, &mut page)?;
        }
        Ok(page)
    }

    /// Writes a whole page, allocating a slot if the page was not resident.
    fn store_page(&mut self, idx: u64, data: &[u8]) -> Result<()> {
        if let Some(handle) = self.pages.get(&idx) {
            return self.pager.write_page(*handle, data);
        }
        let handle = self.pager.allocate()?;
        if let Err(e) = self.pager.write_page(handle, data) {
            self.pager.free(handle);
            return Err(e);
        }
        self.pages.insert(idx, handle);
        Ok(())
    }

    fn release_page(&mut self, idx: u64) {
        if let Some(handle) = self.pages.remove(&idx) {
            self.pager.free(handle);
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len() as u64, self.len)?;
        for chunk in page_chunks(offset, buf.len() as u64, self.page_size) {
            let dst = &mut buf[chunk.buf_range()];
            match self.pages.get(&chunk.page) {
                None => dst.fill(0),
                Some(handle) if chunk.is_full_page(self.page_size) => {
                    self.pager.read_page(*handle, dst)?;
                }
                Some(handle) => {
                    let page = self.load_page(Some(*handle))?;
                    dst.copy_from_slice(&page[chunk.page_range()]);
                }
            }
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        checked_range(offset, buf.len() as u64, self.len)?;
        for chunk in page_chunks(offset, buf.len() as u64, self.page_size) {
            let src = &buf[chunk.buf_range()];
            if chunk.is_full_page(self.page_size) {
                self.store_page(chunk.page, src)?;
                continue;
            }
            let mut page = self.load_page(self.pages.get(&chunk.page).copied())?;
            page[chunk.page_range()].copy_from_slice(src);
            self.store_page(chunk.page, &page)?;
        }
        Ok(buf.len())
    }

    pub fn trim(&mut self, offset: u64, len: u64) -> Result<()> {
        checked_range(offset, len, self.len)?;
        for chunk in page_chunks(offset, len, self.page_size) {
            if chunk.is_full_page(self.page_size) {
                self.release_page(chunk.page);
                continue;
            }
            if let Some(handle) = self.pages.get(&chunk.page).copied() {
                let mut page = self.load_page(Some(handle))?;
                page[chunk.page_range()].fill(0);
                self.pager.write_page(handle, &page)?;
            }
        }
        Ok(())
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        if new_len < self.len {
            let tail_page = new_len / self.page_size as u64;
            let within = (new_len % self.page_size as u64) as usize;
            if within != 0 {
                if let Some(handle) = self.pages.get(&tail_page).copied() {
                    let mut page = self.load_page(Some(handle))?;
                    page[within..].fill(0);
                    self.pager.write_page(handle, &page)?;
                }
            }
            let first_dropped = new_len.div_ceil(self.page_size as u64);
            for (_, handle) in self.pages.split_off(&first_dropped) {
                self.pager.free(handle);
            }
        }
        self.len = new_len;
        Ok(())
    }
}

impl Drop for SwapStore {
    fn drop(&mut self) {
        for (_, handle) in std::mem::take(&mut self.pages) {
            self.pager.free(handle);
        }
    }
}

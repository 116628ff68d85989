use crate::{Result, StoreError};

pub fn checked_end(offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len).ok_or(StoreError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: u64, capacity: u64) -> Result<()> {
    let end = checked_end(offset, len)?;
    if end > capacity {
        return Err(StoreError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Splits `[offset, offset + len)` into page-sized pieces.
///
/// Yields [`PageChunk`]s in ascending order. Callers must have bounds-checked the range.
pub fn page_chunks(offset: u64, len: u64, page_size: usize) -> impl Iterator<Item = PageChunk> {
    let page_size_u64 = page_size as u64;
    let mut pos = 0u64;
    std::iter::from_fn(move || {
        if pos >= len {
            return None;
        }
        let abs = offset + pos;
        let within = (abs % page_size_u64) as usize;
        let len = ((page_size - within) as u64).min(len - pos) as usize;
        let chunk = PageChunk {
            page: abs / page_size_u64,
            within,
            len,
            pos: pos as usize,
        };
        pos += len as u64;
        Some(chunk)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageChunk {
    pub page: u64,
    /// Offset of the chunk inside its page.
    pub within: usize,
    pub len: usize,
    /// Offset of the chunk inside the caller's buffer.
    pub pos: usize,
}

impl PageChunk {
    pub fn is_full_page(&self, page_size: usize) -> bool {
        self.within == 0 && self.len == page_size
    }

    pub fn buf_range(&self) -> std::ops::Range<usize> {
        self.pos..self.pos + self.len
    }

    pub fn page_range(&self) -> std::ops::Range<usize> {
        self.within..self.within + self.len
    }
}

pub fn page_count(len: u64, page_size: usize) -> u64 {
    len.div_ceil(page_size as u64)
}

/// Returns `Some(byte)` when every byte in `data` equals the first one.
pub fn uniform_byte(data: &[u8]) -> Option<u8> {
    let (&first, rest) = data.split_first()?;
    rest.iter().all(|b| *b == first).then_some(first)
}

/// Allocates a zeroed buffer, reporting allocator failure instead of aborting.
pub fn try_alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| StoreError::OutOfResources)?;
    data.resize(len, 0);
    Ok(data)
}

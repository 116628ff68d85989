use std::sync::Arc;

use crate::util::checked_range;
use crate::{Result, StoreError};

/// Read-only view of an image handed over at driver attach.
#[derive(Debug, Clone)]
pub struct PreloadStore {
    image: Arc<[u8]>,
    len: u64,
}

impl PreloadStore {
    /// Exposes the first `len` bytes of `image`.
    pub fn new(image: Arc<[u8]>, len: u64) -> Result<Self> {
        if len > image.len() as u64 {
            return Err(StoreError::InvalidConfig(
                "preloaded image is smaller than the device",
            ));
        }
        Ok(Self { image, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len() as u64, self.len)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.image[start..start + buf.len()]);
        Ok(())
    }

    pub fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(StoreError::ReadOnly)
    }

    pub fn resize(&mut self, _new_len: u64) -> Result<()> {
        Err(StoreError::Unsupported("preloaded image has a fixed size"))
    }
}

/// Store that reads zeros and discards writes.
#[derive(Debug, Clone, Copy)]
pub struct NullStore {
    len: u64,
}

impl NullStore {
    pub fn new(len: u64) -> Self {
        Self { len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len() as u64, self.len)?;
        buf.fill(0);
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        checked_range(offset, buf.len() as u64, self.len)?;
        Ok(buf.len())
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        self.len = new_len;
        Ok(())
    }
}

//! Backing stores for memory-disk style block devices.
//!
//! A device is backed by exactly one [`BackingStore`]:
//!
//! - [`MemoryStore`]: sparse, page-granular memory (optionally reserved up front or with
//!   uniform-page compression)
//! - [`SwapStore`]: logical pages held by a [`Pager`] such as [`MemPager`] or [`FilePager`]
//! - [`VnodeStore`]: reads and writes forwarded to a [`Vnode`] (usually [`StdFileVnode`])
//! - [`PreloadStore`]: a fixed, read-only image
//! - [`NullStore`]: zeros in, bit bucket out
//!
//! Stores know nothing about requests or statistics; they only move bytes.

mod backing;
mod error;
mod fileio;
mod mem;
mod preload;
mod swap;
pub mod util;
mod vnode;

pub use backing::{BackingStore, StoreKind};
pub use error::{Result, StoreError};
pub use mem::{MemoryConfig, MemoryStore, DEFAULT_PAGE_SIZE};
pub use preload::{NullStore, PreloadStore};
pub use swap::{FilePager, MemPager, PageHandle, Pager, SwapStore};
pub use vnode::{StdFileVnode, Vnode, VnodeStore};

#[cfg(test)]
mod proptests;

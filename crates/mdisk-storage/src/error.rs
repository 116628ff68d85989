use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for backing store operations.
///
/// Every variant is request-scoped: a store that returns an error stays usable for the next
/// request. [`StoreError::BackingIo`] keeps the original `io::Error` so callers can log or
/// inspect the underlying cause.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("out of resources while allocating backing pages")]
    OutOfResources,

    #[error("backing {op} failed: {source}")]
    BackingIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("store is read-only")]
    ReadOnly,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(&'static str),
}

impl StoreError {
    pub(crate) fn io(op: &'static str) -> impl FnOnce(io::Error) -> StoreError {
        move |source| StoreError::BackingIo { op, source }
    }
}

use mdisk_storage::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MdError>;

/// Errno values understood by the host disk framework.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EROFS: i32 = 30;
    pub const EOPNOTSUPP: i32 = 45;
}

/// Errors reported by the control plane and by request completions.
///
/// Control-scoped errors (`InvalidConfig`, `UnitInUse`, `NotFound`, `Busy`) are returned to
/// the caller of the control operation and leave the registry untouched. Request-scoped
/// errors (`OutOfResources`, `BackingIo`, `ReadOnly`) only ever fail the request that hit them.
#[derive(Debug, Error)]
pub enum MdError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unit {0} is already in use")]
    UnitInUse(u32),

    #[error("unit {0} does not exist")]
    NotFound(u32),

    #[error("unit {unit} is busy: {reason}")]
    Busy { unit: u32, reason: &'static str },

    #[error("unit {0} is not active")]
    DeviceNotActive(u32),

    #[error("out of resources")]
    OutOfResources,

    #[error("backing store error: {0}")]
    BackingIo(#[source] StoreError),

    #[error("device is read-only")]
    ReadOnly,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl MdError {
    pub fn errno(&self) -> i32 {
        match self {
            MdError::InvalidConfig(_) => errno::EINVAL,
            MdError::UnitInUse(_) => errno::EEXIST,
            MdError::NotFound(_) => errno::ENOENT,
            MdError::Busy { .. } => errno::EBUSY,
            MdError::DeviceNotActive(_) => errno::ENXIO,
            MdError::OutOfResources => errno::ENOMEM,
            MdError::BackingIo(_) => errno::EIO,
            MdError::ReadOnly => errno::EROFS,
            MdError::Unsupported(_) => errno::EOPNOTSUPP,
        }
    }
}

impl From<StoreError> for MdError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfResources => MdError::OutOfResources,
            StoreError::ReadOnly => MdError::ReadOnly,
            StoreError::Unsupported(what) => MdError::Unsupported(what),
            StoreError::InvalidConfig(what) => MdError::InvalidConfig(what.to_string()),
            err @ (StoreError::OutOfBounds { .. }
            | StoreError::OffsetOverflow
            | StoreError::BackingIo { .. }) => MdError::BackingIo(err),
        }
    }
}

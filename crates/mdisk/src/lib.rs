//! Memory-disk style virtual block devices.
//!
//! [`MdDriver`] owns the registry of units. Each unit is a [`DeviceInstance`] bound to one
//! [`mdisk_storage::BackingStore`], with a dedicated worker thread (`md<unit>`) that executes
//! queued [`Request`]s in FIFO order. The disk framework talks to a unit through its
//! [`MdProvider`], which validates framework [`Bio`]s and turns them into requests.
//!
//! ```no_run
//! use mdisk::{Collaborators, DeviceConfig, DriverConfig, MdDriver};
//!
//! let driver = MdDriver::attach(DriverConfig::from_env(), Collaborators::default())?;
//! let unit = driver.create(DeviceConfig::malloc(64 * 1024 * 1024))?;
//! driver.detach(unit, false)?;
//! # Ok::<(), mdisk::MdError>(())
//! ```

mod config;
mod control;
mod device;
mod error;
pub mod geom;
mod host;
mod queue;
mod registry;
mod request;

pub use config::{
    BackingConfig, DeviceConfig, DeviceOptions, DriverConfig, DEFAULT_SECTOR_SIZE, MAX_LABEL_LEN,
};
pub use control::{MdControl, MdDriver, MdReply};
pub use device::{
    AccessCounts, DeviceInstance, DeviceState, DeviceSummary, Geometry, GeometrySnapshot,
    StatsSnapshot,
};
pub use error::{errno, MdError, Result};
pub use geom::{Bio, BioCmd, BioCompletion, BioDone, GeomHost, LocalGeomHost, MdProvider, ProviderInfo};
pub use host::{Collaborators, PreloadImage, StdVnodeOpener, VnodeOpener};
pub use queue::WorkerState;
pub use request::{Completion, Request, RequestKind, RequestOutcome};

pub use mdisk_storage::StoreKind;

#[cfg(test)]
mod proptests;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mdisk_storage::{BackingStore, StoreKind};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::config::{DeviceConfig, DeviceOptions};
use crate::queue::{RequestQueue, WorkerState};
use crate::request::{Request, RequestKind};
use crate::{MdError, Result};

/// Lifecycle of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Configuring,
    Active,
    Detaching,
    Destroyed,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Configuring => "CONFIGURING",
            DeviceState::Active => "ACTIVE",
            DeviceState::Detaching => "DETACHING",
            DeviceState::Destroyed => "DESTROYED",
        }
    }
}

/// Sector layout of a unit. Only the sector count changes, and only through resize.
#[derive(Debug)]
pub struct Geometry {
    sector_size: u32,
    sector_count: AtomicU64,
    fwsectors: u32,
    fwheads: u32,
    removable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GeometrySnapshot {
    pub sector_size: u32,
    pub sector_count: u64,
    pub media_size: u64,
    pub fwsectors: u32,
    pub fwheads: u32,
    pub removable: bool,
}

impl Geometry {
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count.load(Ordering::Acquire)
    }

    pub fn media_size(&self) -> u64 {
        self.sector_count() * u64::from(self.sector_size)
    }

    pub fn snapshot(&self) -> GeometrySnapshot {
        let sector_count = self.sector_count();
        GeometrySnapshot {
            sector_size: self.sector_size,
            sector_count,
            media_size: sector_count * u64::from(self.sector_size),
            fwsectors: self.fwsectors,
            fwheads: self.fwheads,
            removable: self.removable,
        }
    }
}

/// Cumulative counters. Written only by the unit's worker.
#[derive(Debug, Default)]
pub(crate) struct DeviceStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    busy_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub busy_ns: u64,
}

impl DeviceStats {
    fn record(&self, kind: RequestKind, transferred: Option<u64>, busy: Duration) {
        let ops = match kind {
            RequestKind::Read => &self.reads,
            RequestKind::Write => &self.writes,
            RequestKind::Delete => &self.deletes,
            RequestKind::Flush => &self.flushes,
        };
        ops.fetch_add(1, Ordering::Relaxed);
        match (kind, transferred) {
            (_, None) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            (RequestKind::Read, Some(n)) => {
                self.bytes_read.fetch_add(n, Ordering::Relaxed);
            }
            (RequestKind::Write, Some(n)) => {
                self.bytes_written.fetch_add(n, Ordering::Relaxed);
            }
            (RequestKind::Delete | RequestKind::Flush, Some(_)) => {}
        }
        let ns = u64::try_from(busy.as_nanos()).unwrap_or(u64::MAX);
        self.busy_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            busy_ns: self.busy_ns.load(Ordering::Relaxed),
        }
    }
}

/// Open references held on a unit's provider: readers, writers, exclusive holders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessCounts {
    pub r: u32,
    pub w: u32,
    pub e: u32,
}

impl AccessCounts {
    pub fn is_open(&self) -> bool {
        self.r > 0 || self.w > 0 || self.e > 0
    }
}

#[derive(Debug, Default)]
struct Access {
    counts: AccessCounts,
    /// Set by a forced detach. Later closes are accepted and ignored.
    invalidated: bool,
}

fn apply(count: u32, delta: i32) -> Option<u32> {
    count.checked_add_signed(delta)
}

/// Point-in-time description of a unit, as returned by list and query.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub unit: u32,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: StoreKind,
    pub state: DeviceState,
    pub worker: WorkerState,
    #[serde(flatten)]
    pub geometry: GeometrySnapshot,
    pub read_only: bool,
    pub options: DeviceOptions,
    pub label: Option<String>,
    pub path: Option<PathBuf>,
    pub access: AccessCounts,
    pub pending: usize,
    pub stats: StatsSnapshot,
}

fn serialize_kind<S: Serializer>(kind: &StoreKind, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.as_str())
}

/// Per-unit state record binding a backing store to identity, geometry, and statistics.
#[derive(Debug)]
pub struct DeviceInstance {
    unit: u32,
    kind: StoreKind,
    geometry: Geometry,
    options: DeviceOptions,
    read_only: bool,
    resizable: bool,
    can_delete: bool,
    label: Option<String>,
    path: Option<PathBuf>,
    store: Mutex<BackingStore>,
    stats: DeviceStats,
    access: Mutex<Access>,
    queue: RequestQueue,
    worker: Mutex<Option<JoinHandle<()>>>,
    resizing: AtomicBool,
}

impl DeviceInstance {
    /// Binds `store` to `unit`. The instance starts out CONFIGURING.
    pub(crate) fn new(unit: u32, config: &DeviceConfig, store: BackingStore, max_pending: usize) -> Self {
        let sector_size = config.sector_size;
        Self {
            unit,
            kind: store.kind(),
            geometry: Geometry {
                sector_size,
                sector_count: AtomicU64::new(store.len() / u64::from(sector_size)),
                fwsectors: config.fwsectors,
                fwheads: config.fwheads,
                removable: config.options.removable,
            },
            options: config.options,
            read_only: config.options.read_only || store.is_read_only(),
            resizable: store.supports_resize(),
            can_delete: store.can_delete(),
            label: config.label.clone(),
            path: store.path().map(|p| p.to_path_buf()),
            store: Mutex::new(store),
            stats: DeviceStats::default(),
            access: Mutex::new(Access::default()),
            queue: RequestQueue::new(unit, max_pending),
            worker: Mutex::new(None),
            resizing: AtomicBool::new(false),
        }
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    pub fn media_size(&self) -> u64 {
        self.geometry.media_size()
    }

    pub fn state(&self) -> DeviceState {
        self.queue.device_state()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn supports_resize(&self) -> bool {
        self.resizable
    }

    pub fn can_delete(&self) -> bool {
        self.can_delete
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn access_counts(&self) -> AccessCounts {
        self.lock_access().counts
    }

    /// Bytes of memory the store has committed. Waits for the in-flight request.
    pub fn allocated_bytes(&self) -> Option<u64> {
        self.lock_store().allocated_bytes()
    }

    pub(crate) fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Queues `req` for the worker. See [`Request`] for the resolution guarantee.
    pub fn submit(&self, req: Request) -> Result<()> {
        self.queue.enqueue(req)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            unit: self.unit,
            kind: self.kind,
            state: self.state(),
            worker: self.queue.worker_state(),
            geometry: self.geometry.snapshot(),
            read_only: self.read_only,
            options: self.options,
            label: self.label.clone(),
            path: self.path.clone(),
            access: self.access_counts(),
            pending: self.queue.pending(),
            stats: self.stats.snapshot(),
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, BackingStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_access(&self) -> MutexGuard<'_, Access> {
        match self.access.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs one request against the store. Called only from the worker.
    pub(crate) fn execute(&self, mut req: Request) {
        let kind = req.kind();
        let offset = req.offset();
        let length = req.length();

        let started = Instant::now();
        let result = self.perform(&mut req);
        self.stats
            .record(kind, result.as_ref().ok().copied(), started.elapsed());

        match &result {
            Ok(n) => debug!(?kind, offset, length, transferred = *n, "request complete"),
            Err(err) => warn!(?kind, offset, length, error = %err, "request failed"),
        }
        req.complete(result);
    }

    fn perform(&self, req: &mut Request) -> Result<u64> {
        let offset = req.offset();
        let length = req.length();
        let mut store = self.lock_store();
        match req.kind() {
            RequestKind::Read => {
                store.read_at(offset, req.data_mut())?;
                Ok(length)
            }
            RequestKind::Write => {
                if self.read_only {
                    return Err(MdError::ReadOnly);
                }
                let written = store.write_at(offset, req.data())?;
                Ok(written as u64)
            }
            RequestKind::Delete => {
                if self.read_only {
                    return Err(MdError::ReadOnly);
                }
                store.trim(offset, length)?;
                Ok(length)
            }
            RequestKind::Flush => {
                store.flush()?;
                Ok(0)
            }
        }
    }

    /// Adjusts the open references by the given deltas.
    pub fn access(&self, dr: i32, dw: i32, de: i32) -> Result<AccessCounts> {
        let opening = dr > 0 || dw > 0 || de > 0;
        let mut access = self.lock_access();
        if access.invalidated {
            if opening {
                return Err(MdError::DeviceNotActive(self.unit));
            }
            return Ok(access.counts);
        }
        if opening && self.state() != DeviceState::Active {
            return Err(MdError::DeviceNotActive(self.unit));
        }
        if self.read_only && (dw > 0 || de > 0) {
            return Err(MdError::ReadOnly);
        }
        let current = access.counts;
        let (Some(r), Some(w), Some(e)) = (
            apply(current.r, dr),
            apply(current.w, dw),
            apply(current.e, de),
        ) else {
            return Err(MdError::InvalidConfig(format!(
                "access r{dr}w{dw}e{de} would drop below zero"
            )));
        };
        access.counts = AccessCounts { r, w, e };
        Ok(access.counts)
    }


    pub(crate) fn is_resizing(&self) -> bool {
        self.resizing.load(Ordering::Acquire)
    }

    /// Marks a resize as running. Returns `false` if one already is.
    pub(crate) fn try_begin_resize(&self) -> bool {
        self.resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_resize(&self) {
        self.resizing.store(false, Ordering::Release);
    }

    /// Resizes the store to `sector_count` sectors with the worker paused.
    ///
    /// Requests submitted meanwhile stay queued and run against the new size.
    pub(crate) fn resize(&self, sector_count: u64) -> Result<()> {
        let new_len = sector_count
            .checked_mul(u64::from(self.geometry.sector_size))
            .ok_or_else(|| MdError::InvalidConfig(format!("{sector_count} sectors overflow")))?;
        self.queue.pause();
        let result = self.lock_store().resize(new_len);
        if result.is_ok() {
            self.geometry
                .sector_count
                .store(sector_count, Ordering::Release);
        }
        self.queue.resume();
        result.map_err(MdError::from)
    }

    pub(crate) fn activate(&self) {
        self.queue.activate();
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *self.lock_worker() = Some(handle);
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stops new requests and new opens. Returns the references that were open.
    ///
    /// Held references make this `Busy` unless `force` is set, in which case they are
    /// dropped and later closes are ignored. Opens are serialized against this by the
    /// access lock.
    pub(crate) fn begin_detach(&self, force: bool) -> Result<AccessCounts> {
        let mut access = self.lock_access();
        let open = access.counts;
        if open.is_open() && !force {
            return Err(MdError::Busy {
                unit: self.unit,
                reason: "device is open",
            });
        }
        if !self.queue.begin_detach() {
            return Err(MdError::NotFound(self.unit));
        }
        access.invalidated = true;
        access.counts = AccessCounts::default();
        Ok(open)
    }

    /// Waits for the worker to drain the queue and exit, then marks the unit destroyed.
    pub(crate) fn join_worker(&self) {
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(unit = self.unit, "worker panicked; failing its remaining requests");
            }
        }
        let leftover = self.queue.finish_detach();
        drop(leftover);
    }
}

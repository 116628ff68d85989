//! Disk-framework glue: provider registration and translation of framework bios into
//! [`Request`]s.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::device::{AccessCounts, DeviceInstance, DeviceState};
use crate::errno;
use crate::request::{Completion, Request, RequestOutcome};
use crate::{MdError, Result};

pub const ATTR_CANDELETE: &str = "GEOM::candelete";
pub const ATTR_FWSECTORS: &str = "GEOM::fwsectors";
pub const ATTR_FWHEADS: &str = "GEOM::fwheads";

/// Bio command codes as the framework numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BioCmd {
    Read = 1,
    Write = 2,
    Delete = 3,
    GetAttr = 4,
    Flush = 5,
}

impl BioCmd {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(BioCmd::Read),
            2 => Some(BioCmd::Write),
            3 => Some(BioCmd::Delete),
            4 => Some(BioCmd::GetAttr),
            5 => Some(BioCmd::Flush),
            _ => None,
        }
    }
}

/// What the framework learns when a bio finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BioCompletion {
    /// 0 on success, otherwise an errno.
    pub error: i32,
    pub completed: u64,
    pub resid: u64,
    /// Read data, the written buffer handed back, or an attribute value.
    pub data: Vec<u8>,
}

impl BioCompletion {
    fn failed(error: i32, length: i64, data: Vec<u8>) -> Self {
        Self {
            error,
            completed: 0,
            resid: u64::try_from(length).unwrap_or(0),
            data,
        }
    }

    /// Decodes an integer attribute answer.
    pub fn attr_int(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(i32::from_ne_bytes(bytes))
    }
}

/// Completion callback of a bio.
pub trait BioDone: Send {
    fn done(self: Box<Self>, completion: BioCompletion);
}

impl<F: FnOnce(BioCompletion) + Send> BioDone for F {
    fn done(self: Box<Self>, completion: BioCompletion) {
        (*self)(completion)
    }
}

/// A framework block I/O request in its wire shape.
///
/// Fields are unvalidated; [`MdProvider::start`] fails malformed bios with the matching errno.
pub struct Bio {
    pub cmd: u8,
    pub offset: i64,
    pub length: i64,
    pub data: Vec<u8>,
    pub attribute: Option<String>,
    done: Box<dyn BioDone>,
}

impl Bio {
    pub fn new(cmd: u8, offset: i64, length: i64, data: Vec<u8>, done: impl BioDone + 'static) -> Self {
        Self {
            cmd,
            offset,
            length,
            data,
            attribute: None,
            done: Box::new(done),
        }
    }

    /// The read buffer is sized by [`MdProvider::start`] once `length` has been checked.
    pub fn read(offset: i64, length: i64, done: impl BioDone + 'static) -> Self {
        Self::new(BioCmd::Read as u8, offset, length, Vec::new(), done)
    }

    pub fn write(offset: i64, data: Vec<u8>, done: impl BioDone + 'static) -> Self {
        let length = i64::try_from(data.len()).unwrap_or(i64::MAX);
        Self::new(BioCmd::Write as u8, offset, length, data, done)
    }

    pub fn delete(offset: i64, length: i64, done: impl BioDone + 'static) -> Self {
        Self::new(BioCmd::Delete as u8, offset, length, Vec::new(), done)
    }

    pub fn flush(done: impl BioDone + 'static) -> Self {
        Self::new(BioCmd::Flush as u8, 0, 0, Vec::new(), done)
    }

    pub fn getattr(name: impl Into<String>, done: impl BioDone + 'static) -> Self {
        let mut bio = Self::new(BioCmd::GetAttr as u8, 0, 0, Vec::new(), done);
        bio.attribute = Some(name.into());
        bio
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("cmd", &self.cmd)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("attribute", &self.attribute)
            .finish()
    }
}

/// What the framework is told about a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    pub unit: u32,
    pub sector_size: u32,
    pub media_size: u64,
    pub fwsectors: u32,
    pub fwheads: u32,
    pub candelete: bool,
}

/// The disk framework's provider registry.
pub trait GeomHost: Send + Sync + fmt::Debug {
    fn new_provider(&self, info: &ProviderInfo) -> Result<()>;
    fn resize_provider(&self, unit: u32, media_size: u64);
    /// Removes the provider; outstanding consumers see `error`.
    fn wither_provider(&self, unit: u32, error: i32);
}

/// In-process [`GeomHost`] that records what it is told.
#[derive(Debug, Default)]
pub struct LocalGeomHost {
    providers: Mutex<BTreeMap<u32, ProviderInfo>>,
    withered: Mutex<Vec<(u32, i32)>>,
    refuse: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LocalGeomHost {
    pub fn providers(&self) -> Vec<ProviderInfo> {
        lock(&self.providers).values().cloned().collect()
    }

    pub fn provider(&self, unit: u32) -> Option<ProviderInfo> {
        lock(&self.providers).get(&unit).cloned()
    }

    pub fn withered(&self) -> Vec<(u32, i32)> {
        lock(&self.withered).clone()
    }

    /// Makes later registrations fail with `OutOfResources`.
    pub fn refuse_registrations(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }
}

impl GeomHost for LocalGeomHost {
    fn new_provider(&self, info: &ProviderInfo) -> Result<()> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(MdError::OutOfResources);
        }
        lock(&self.providers).insert(info.unit, info.clone());
        Ok(())
    }

    fn resize_provider(&self, unit: u32, media_size: u64) {
        if let Some(info) = lock(&self.providers).get_mut(&unit) {
            info.media_size = media_size;
        }
    }

    fn wither_provider(&self, unit: u32, error: i32) {
        lock(&self.providers).remove(&unit);
        lock(&self.withered).push((unit, error));
    }
}

/// The framework-facing side of one unit.
#[derive(Debug, Clone)]
pub struct MdProvider {
    device: Arc<DeviceInstance>,
    max_io_bytes: u64,
}

impl MdProvider {
    pub(crate) fn new(device: Arc<DeviceInstance>, max_io_bytes: u64) -> Self {
        Self {
            device,
            max_io_bytes,
        }
    }

    pub fn name(&self) -> String {
        format!("md{}", self.device.unit())
    }

    pub fn unit(&self) -> u32 {
        self.device.unit()
    }

    pub(crate) fn info(device: &DeviceInstance) -> ProviderInfo {
        let geometry = device.geometry().snapshot();
        ProviderInfo {
            name: format!("md{}", device.unit()),
            unit: device.unit(),
            sector_size: geometry.sector_size,
            media_size: geometry.media_size,
            fwsectors: geometry.fwsectors,
            fwheads: geometry.fwheads,
            candelete: device.can_delete(),
        }
    }

    /// Accepts a bio. `done` is always called, possibly before this returns.
    pub fn start(&self, bio: Bio) {
        let Bio {
            cmd,
            offset,
            length,
            mut data,
            attribute,
            done,
        } = bio;

        let Some(cmd) = BioCmd::from_raw(cmd) else {
            return done.done(BioCompletion::failed(errno::EOPNOTSUPP, length, data));
        };
        if self.device.state() != DeviceState::Active {
            return done.done(BioCompletion::failed(errno::ENXIO, length, data));
        }
        match cmd {
            BioCmd::GetAttr => return done.done(self.getattr(attribute.as_deref())),
            BioCmd::Flush => {
                let completion = bio_completion(done, length);
                let _ = self.device.submit(Request::flush(completion));
                return;
            }
            BioCmd::Read | BioCmd::Write | BioCmd::Delete => {}
        }

        let sector_size = i64::from(self.device.sector_size());
        if offset < 0 || length < 0 || offset % sector_size != 0 || length % sector_size != 0 {
            return done.done(BioCompletion::failed(errno::EINVAL, length, data));
        }
        if cmd != BioCmd::Delete && length as u64 > self.max_io_bytes {
            return done.done(BioCompletion::failed(errno::EINVAL, length, data));
        }
        if cmd == BioCmd::Write && data.len() as u64 != length as u64 {
            return done.done(BioCompletion::failed(errno::EINVAL, length, data));
        }

        let (offset, requested) = (offset as u64, length as u64);
        let media_size = self.device.media_size();
        if offset > media_size {
            return done.done(BioCompletion::failed(errno::EIO, length, data));
        }
        if offset == media_size || requested == 0 {
            return done.done(BioCompletion {
                error: 0,
                completed: 0,
                resid: requested,
                data,
            });
        }
        let length = requested.min(media_size - offset);
        if length < requested {
            debug!(unit = self.device.unit(), offset, requested, length, "truncating bio at end of media");
        }

        let completion = bio_completion(done, requested as i64);
        // Lengths are bounded by the media size or max_io_bytes at this point.
        let req = match cmd {
            BioCmd::Read => {
                data.resize(length as usize, 0);
                Request::read(offset, data, completion)
            }
            BioCmd::Write => {
                data.truncate(length as usize);
                Request::write(offset, data, completion)
            }
            _ => Request::delete(offset, length, completion),
        };
        // A rejected request has already been completed.
        let _ = self.device.submit(req);
    }

    fn getattr(&self, attribute: Option<&str>) -> BioCompletion {
        let value = match attribute {
            Some(ATTR_CANDELETE) => i32::from(self.device.can_delete()),
            Some(ATTR_FWSECTORS) => self.device.geometry().snapshot().fwsectors as i32,
            Some(ATTR_FWHEADS) => self.device.geometry().snapshot().fwheads as i32,
            _ => return BioCompletion::failed(errno::EOPNOTSUPP, 0, Vec::new()),
        };
        BioCompletion {
            error: 0,
            completed: 4,
            resid: 0,
            data: value.to_ne_bytes().to_vec(),
        }
    }

    /// Adjusts open references. Errors carry the framework's errno via [`MdError::errno`].
    pub fn access(&self, dr: i32, dw: i32, de: i32) -> Result<AccessCounts> {
        self.device.access(dr, dw, de)
    }

    /// Configuration dump in the framework's XML fragment form, one element per line.
    pub fn dumpconf(&self, indent: &str) -> String {
        let summary = self.device.summary();
        let access = summary.access;
        let stats = summary.stats;
        let mut out = String::new();
        let mut element = |name: &str, value: &dyn fmt::Display| {
            let _ = writeln!(out, "{indent}<{name}>{value}</{name}>");
        };
        element("unit", &summary.unit);
        element("state", &summary.state.as_str());
        element(
            "access",
            &format_args!("r{}w{}e{}", access.r, access.w, access.e),
        );
        element("type", &summary.kind);
        element("length", &summary.geometry.media_size);
        element("sectorsize", &summary.geometry.sector_size);
        element("fwsectors", &summary.geometry.fwsectors);
        element("fwheads", &summary.geometry.fwheads);
        element("readonly", &summary.read_only);
        if let Some(path) = &summary.path {
            element("file", &escape_xml(&path.display().to_string()));
        }
        if let Some(label) = &summary.label {
            element("label", &escape_xml(label));
        }
        element("reads", &stats.reads);
        element("writes", &stats.writes);
        element("deletes", &stats.deletes);
        element("flushes", &stats.flushes);
        element("errors", &stats.errors);
        element("bytes_read", &stats.bytes_read);
        element("bytes_written", &stats.bytes_written);
        out
    }
}

fn bio_completion(done: Box<dyn BioDone>, requested: i64) -> Completion {
    let requested = u64::try_from(requested).unwrap_or(0);
    Completion::new(move |outcome: RequestOutcome| {
        let (error, completed) = match &outcome.result {
            Ok(n) => (0, *n),
            Err(err) => (err.errno(), 0),
        };
        done.done(BioCompletion {
            error,
            completed,
            resid: requested.saturating_sub(completed),
            data: outcome.data,
        });
    })
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

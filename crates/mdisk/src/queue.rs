use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info_span};

use crate::device::{DeviceInstance, DeviceState};
use crate::request::Request;
use crate::{MdError, Result};

/// What the worker of a unit is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Executing requests.
    Draining,
    /// Exited; nothing more will be executed.
    Stopped,
}

#[derive(Debug)]
struct QueueInner {
    pending: VecDeque<Request>,
    device: DeviceState,
    worker: WorkerState,
    in_flight: bool,
    paused: bool,
}

/// FIFO of accepted requests for one unit, shared by the submitters and the worker.
///
/// The device state lives here too, so that accepting a request and starting a detach are
/// ordered by the same lock: a request is either queued before the detach (and drained) or
/// rejected.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    unit: u32,
    max_pending: usize,
    inner: Mutex<QueueInner>,
    /// Signalled when work arrives, the queue resumes, or a detach starts.
    work: Condvar,
    /// Signalled when the in-flight request finishes or the worker changes state.
    idle: Condvar,
}

impl RequestQueue {
    pub(crate) fn new(unit: u32, max_pending: usize) -> Self {
        Self {
            unit,
            max_pending,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                device: DeviceState::Configuring,
                worker: WorkerState::Idle,
                in_flight: false,
                paused: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait<'a>(&self, cv: &Condvar, guard: MutexGuard<'a, QueueInner>) -> MutexGuard<'a, QueueInner> {
        match cv.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn device_state(&self) -> DeviceState {
        self.lock().device
    }

    pub(crate) fn worker_state(&self) -> WorkerState {
        self.lock().worker
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn activate(&self) {
        let mut inner = self.lock();
        if inner.device == DeviceState::Configuring {
            inner.device = DeviceState::Active;
        }
    }

    /// Accepts `req` for execution.
    ///
    /// Never blocks on I/O. A rejected request is resolved through its own completion with
    /// the same error that is returned here.
    pub(crate) fn enqueue(&self, mut req: Request) -> Result<()> {
        let mut inner = self.lock();
        let reject: Option<fn(u32) -> MdError> = if inner.device != DeviceState::Active {
            Some(MdError::DeviceNotActive)
        } else if inner.pending.len() >= self.max_pending
            || inner.pending.try_reserve(1).is_err()
        {
            Some(|_| MdError::OutOfResources)
        } else {
            None
        };
        if let Some(reject) = reject {
            drop(inner);
            req.complete(Err(reject(self.unit)));
            return Err(reject(self.unit));
        }
        req.bind(self.unit);
        inner.pending.push_back(req);
        drop(inner);
        self.work.notify_one();
        Ok(())
    }

    /// Blocks until there is a request to execute, or returns `None` once the unit is
    /// detaching and nothing is left.
    pub(crate) fn next_request(&self) -> Option<Request> {
        let mut inner = self.lock();
        loop {
            if !inner.paused {
                if let Some(req) = inner.pending.pop_front() {
                    inner.in_flight = true;
                    inner.worker = WorkerState::Draining;
                    return Some(req);
                }
            }
            if inner.pending.is_empty()
                && matches!(inner.device, DeviceState::Detaching | DeviceState::Destroyed)
            {
                inner.worker = WorkerState::Stopped;
                drop(inner);
                self.idle.notify_all();
                return None;
            }
            if inner.worker != WorkerState::Idle {
                inner.worker = WorkerState::Idle;
                self.idle.notify_all();
            }
            inner = self.wait(&self.work, inner);
        }
    }

    pub(crate) fn finish_request(&self) {
        self.lock().in_flight = false;
        self.idle.notify_all();
    }

    /// Holds further dequeues and waits for the in-flight request, if any, to finish.
    ///
    /// Submitters keep queueing while paused.
    pub(crate) fn pause(&self) {
        let mut inner = self.lock();
        inner.paused = true;
        while inner.in_flight {
            inner = self.wait(&self.idle, inner);
        }
    }

    pub(crate) fn resume(&self) {
        self.lock().paused = false;
        self.work.notify_all();
    }

    /// Stops accepting requests. Returns `false` if a detach already started.
    pub(crate) fn begin_detach(&self) -> bool {
        let mut inner = self.lock();
        match inner.device {
            DeviceState::Configuring | DeviceState::Active => {
                inner.device = DeviceState::Detaching;
                drop(inner);
                self.work.notify_all();
                true
            }
            DeviceState::Detaching | DeviceState::Destroyed => false,
        }
    }

    /// Marks the unit destroyed once its worker is gone and hands back whatever it never
    /// got to execute. Dropping those requests resolves them as not active.
    pub(crate) fn finish_detach(&self) -> Vec<Request> {
        let mut inner = self.lock();
        inner.device = DeviceState::Destroyed;
        inner.worker = WorkerState::Stopped;
        inner.in_flight = false;
        let leftover = inner.pending.drain(..).collect();
        drop(inner);
        self.idle.notify_all();
        leftover
    }
}

/// Starts the worker thread `md<unit>` for `device`.
pub(crate) fn spawn_worker(device: Arc<DeviceInstance>) -> io::Result<JoinHandle<()>> {
    let unit = device.unit();
    thread::Builder::new()
        .name(format!("md{unit}"))
        .spawn(move || {
            let span = info_span!("md", unit);
            let _enter = span.enter();
            debug!("worker started");
            let queue = device.queue();
            while let Some(req) = queue.next_request() {
                device.execute(req);
                queue.finish_request();
            }
            debug!("worker stopped");
        })
}

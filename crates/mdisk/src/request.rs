use std::fmt;
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::MdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Read,
    Write,
    Flush,
    Delete,
}

/// Final state of a request, handed to its completion exactly once.
#[derive(Debug)]
pub struct RequestOutcome {
    pub kind: RequestKind,
    pub offset: u64,
    pub length: u64,
    /// Bytes transferred on success.
    pub result: Result<u64, MdError>,
    /// The request's buffer, returned to the submitter. Holds the data for reads.
    pub data: Vec<u8>,
}

impl RequestOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

type Sink = Box<dyn FnOnce(RequestOutcome) + Send>;

/// Where a request reports its outcome.
pub struct Completion {
    sink: Sink,
}

impl Completion {
    pub fn new(f: impl FnOnce(RequestOutcome) + Send + 'static) -> Self {
        Self { sink: Box::new(f) }
    }

    /// Completion that forwards the outcome into a channel.
    pub fn channel() -> (Self, mpsc::Receiver<RequestOutcome>) {
        let (tx, rx) = mpsc::channel();
        let completion = Self::new(move |outcome| {
            // The submitter may have stopped listening; that is its choice.
            let _ = tx.send(outcome);
        });
        (completion, rx)
    }

    /// Completion that sends into an existing channel, for collecting many outcomes in order.
    pub fn sender(tx: mpsc::Sender<RequestOutcome>) -> Self {
        Self::new(move |outcome| {
            let _ = tx.send(outcome);
        })
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion { .. }")
    }
}

/// One block I/O operation in the driver's internal form.
///
/// Once a device accepts a request it is resolved exactly once: either by the worker or,
/// should the request be dropped unresolved, with [`MdError::DeviceNotActive`].
pub struct Request {
    kind: RequestKind,
    offset: u64,
    length: u64,
    data: Vec<u8>,
    completion: Option<Sink>,
    unit: Option<u32>,
}

impl Request {
    /// Reads `buf.len()` bytes at `offset` into `buf`.
    pub fn read(offset: u64, buf: Vec<u8>, completion: Completion) -> Self {
        let length = buf.len() as u64;
        Self::new(RequestKind::Read, offset, length, buf, completion)
    }

    pub fn write(offset: u64, data: Vec<u8>, completion: Completion) -> Self {
        let length = data.len() as u64;
        Self::new(RequestKind::Write, offset, length, data, completion)
    }

    pub fn flush(completion: Completion) -> Self {
        Self::new(RequestKind::Flush, 0, 0, Vec::new(), completion)
    }

    pub fn delete(offset: u64, length: u64, completion: Completion) -> Self {
        Self::new(RequestKind::Delete, offset, length, Vec::new(), completion)
    }

    fn new(kind: RequestKind, offset: u64, length: u64, data: Vec<u8>, completion: Completion) -> Self {
        Self {
            kind,
            offset,
            length,
            data,
            completion: Some(completion.sink),
            unit: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Marks the request as owned by `unit`.
    pub(crate) fn bind(&mut self, unit: u32) {
        self.unit = Some(unit);
    }

    pub(crate) fn complete(mut self, result: Result<u64, MdError>) {
        self.resolve(result);
    }

    fn resolve(&mut self, result: Result<u64, MdError>) {
        let Some(sink) = self.completion.take() else {
            return;
        };
        sink(RequestOutcome {
            kind: self.kind,
            offset: self.offset,
            length: self.length,
            result,
            data: std::mem::take(&mut self.data),
        });
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(unit) = self.unit {
            self.resolve(Err(MdError::DeviceNotActive(unit)));
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("unit", &self.unit)
            .finish()
    }
}

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use mdisk::{Completion, MdDriver, Request, RequestOutcome, VnodeOpener};
use mdisk_storage::Vnode;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mdisk=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Holds callers of [`Gate::pass`] until [`Gate::release`].
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<(bool, bool)>,
    cv: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.cv.notify_all();
        while !state.1 {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Blocks until something is held at the gate.
    pub fn wait_entered(&self) {
        let state = self.state.lock().unwrap();
        let (state, timeout) = self
            .cv
            .wait_timeout_while(state, TIMEOUT, |(entered, _)| !*entered)
            .unwrap();
        assert!(!timeout.timed_out(), "nothing reached the gate");
        drop(state);
    }

    pub fn release(&self) {
        self.state.lock().unwrap().1 = true;
        self.cv.notify_all();
    }
}

/// In-memory file whose operations take a configurable time, keyed by sector.
#[derive(Debug)]
pub struct SlowVnode {
    data: Vec<u8>,
    delays: Arc<[Duration]>,
    resize_gate: Option<Arc<Gate>>,
}

impl SlowVnode {
    fn delay(&self, offset: u64) {
        if self.delays.is_empty() {
            return;
        }
        let idx = (offset / 512) as usize % self.delays.len();
        thread::sleep(self.delays[idx]);
    }
}

impl Vnode for SlowVnode {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.delay(offset);
        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.delay(offset);
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        if let Some(gate) = &self.resize_gate {
            gate.pass();
        }
        self.data.resize(len as usize, 0);
        Ok(())
    }
}

/// Opens a fresh [`SlowVnode`] of `len` bytes for any path.
#[derive(Debug)]
pub struct SlowOpener {
    pub len: u64,
    pub delays: Arc<[Duration]>,
    pub opened: Mutex<Vec<String>>,
    pub resize_gate: Option<Arc<Gate>>,
}

impl SlowOpener {
    pub fn new(len: u64, delays: Vec<Duration>) -> Self {
        Self {
            len,
            delays: delays.into(),
            opened: Mutex::new(Vec::new()),
            resize_gate: None,
        }
    }

    /// Makes every `set_len` on opened files wait at `gate`.
    pub fn with_resize_gate(mut self, gate: Arc<Gate>) -> Self {
        self.resize_gate = Some(gate);
        self
    }
}

impl VnodeOpener for SlowOpener {
    fn open(&self, path: &Path, _read_only: bool) -> io::Result<Box<dyn Vnode>> {
        self.opened
            .lock()
            .unwrap()
            .push(path.display().to_string());
        Ok(Box::new(SlowVnode {
            data: vec![0u8; self.len as usize],
            delays: Arc::clone(&self.delays),
            resize_gate: self.resize_gate.clone(),
        }))
    }
}

pub fn recv(rx: &Receiver<RequestOutcome>) -> RequestOutcome {
    rx.recv_timeout(TIMEOUT).expect("request never completed")
}

pub fn write(driver: &MdDriver, unit: u32, offset: u64, data: Vec<u8>) -> RequestOutcome {
    let (completion, rx) = Completion::channel();
    driver
        .device(unit)
        .expect("unit exists")
        .submit(Request::write(offset, data, completion))
        .expect("write accepted");
    recv(&rx)
}

pub fn read(driver: &MdDriver, unit: u32, offset: u64, len: usize) -> RequestOutcome {
    let (completion, rx) = Completion::channel();
    driver
        .device(unit)
        .expect("unit exists")
        .submit(Request::read(offset, vec![0u8; len], completion))
        .expect("read accepted");
    recv(&rx)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

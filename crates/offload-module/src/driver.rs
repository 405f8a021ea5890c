//! `Driver` — the backend sum type.
//!
//! Backend choice is made once, at construction, from a `BackendKind`.
//! Every call after that is a single `match`; no trait objects on the
//! submission path.

use offload_core::backend::BackendKind;
use offload_core::entry::{IoCompletion, IoRequest};
use offload_core::error::Result;
use offload_core::io_backend::IoDriver;

use crate::aio_driver::{AioDriver, AioDriverConfig};
use crate::uring_driver::{UringDriver, UringDriverConfig};

use std::os::unix::io::RawFd;

pub enum Driver {
    Uring(UringDriver),
    Aio(AioDriver),
}

impl Driver {
    /// Build the driver for `backend`, sized for `slots` outstanding requests.
    pub fn for_backend(backend: BackendKind, slots: usize) -> Result<Self> {
        match backend {
            BackendKind::Uring => Ok(Driver::Uring(UringDriver::new(UringDriverConfig::for_slots(slots))?)),
            BackendKind::Aio => Ok(Driver::Aio(AioDriver::new(AioDriverConfig { max_inflight: slots }))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Driver::Uring(_) => BackendKind::Uring,
            Driver::Aio(_) => BackendKind::Aio,
        }
    }
}

impl IoDriver for Driver {
    fn submit(&mut self, req: &IoRequest) -> Result<()> {
        match self {
            Driver::Uring(d) => d.submit(req),
            Driver::Aio(d) => d.submit(req),
        }
    }

    fn flush(&mut self) -> Result<usize> {
        match self {
            Driver::Uring(d) => d.flush(),
            Driver::Aio(d) => d.flush(),
        }
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        match self {
            Driver::Uring(d) => d.poll_completions(out),
            Driver::Aio(d) => d.poll_completions(out),
        }
    }

    fn drain_all(&mut self, out: &mut Vec<IoCompletion>) -> Result<()> {
        match self {
            Driver::Uring(d) => d.drain_all(out),
            Driver::Aio(d) => d.drain_all(out),
        }
    }

    fn inflight(&self) -> usize {
        match self {
            Driver::Uring(d) => d.inflight(),
            Driver::Aio(d) => d.inflight(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Driver::Uring(d) => d.capacity(),
            Driver::Aio(d) => d.capacity(),
        }
    }

    fn completion_fd(&self) -> Option<RawFd> {
        match self {
            Driver::Uring(d) => d.completion_fd(),
            Driver::Aio(d) => d.completion_fd(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Driver::Uring(d) => d.name(),
            Driver::Aio(d) => d.name(),
        }
    }
}

//! `AioDriver` — POSIX AIO `IoDriver` implementation.
//!
//! Each request gets its own heap-pinned `aiocb`, handed to
//! `aio_read()`/`aio_write()` with `SIGEV_NONE`. There is no kernel queue
//! to kick, so `flush()` is a no-op; completions are discovered by polling
//! `aio_error()` on every outstanding control block, and `drain_all()`
//! sleeps in `aio_suspend()`.
//!
//! glibc services these requests on its own helper threads, so this
//! driver works wherever io_uring is unavailable.

use nix::errno::Errno;
use offload_core::entry::{IoCompletion, IoOp, IoRequest, SlotId};
use offload_core::error::{IoFailure, OffloadError, Result};
use offload_core::io_backend::IoDriver;

use std::ptr;

/// Configuration for AioDriver.
#[derive(Debug, Clone)]
pub struct AioDriverConfig {
    /// Max outstanding control blocks before `submit()` reports `RingFull`.
    pub max_inflight: usize,
}

impl Default for AioDriverConfig {
    fn default() -> Self {
        Self { max_inflight: 128 }
    }
}

/// One outstanding control block.
///
/// Boxed so the address the C library holds stays fixed until reaped.
struct AioOp {
    slot: SlotId,
    cb: Box<libc::aiocb>,
}

// Safety: the raw buffer pointer inside the aiocb is owned by the engine's
// in-flight record; the control block itself is only touched by the thread
// holding the driver.
unsafe impl Send for AioOp {}

pub struct AioDriver {
    ops: Vec<AioOp>,
    max_inflight: usize,
}

impl AioDriver {
    pub fn new(config: AioDriverConfig) -> Self {
        let max_inflight = config.max_inflight.max(1);
        Self {
            ops: Vec::with_capacity(max_inflight),
            max_inflight,
        }
    }

    fn control_block(req: &IoRequest) -> Result<Box<libc::aiocb>> {
        let offset = libc::off_t::try_from(req.offset)
            .map_err(|_| OffloadError::InvalidSubmission(libc::EINVAL))?;

        // Safety: aiocb is a plain C struct; all-zero is its documented
        // initial state before the public fields are filled in.
        let mut cb: Box<libc::aiocb> = Box::new(unsafe { std::mem::zeroed() });
        cb.aio_fildes = req.fd;
        cb.aio_offset = offset;
        cb.aio_buf = req.ptr as *mut libc::c_void;
        cb.aio_nbytes = req.len;
        cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
        Ok(cb)
    }

    /// Reap the control block at `idx` if it has finished.
    fn try_reap(&mut self, idx: usize) -> Option<IoCompletion> {
        let op = &mut self.ops[idx];
        let cb: *mut libc::aiocb = &mut *op.cb;
        // Safety: `cb` was accepted by aio_read/aio_write and not yet reaped.
        let status = unsafe { libc::aio_error(cb) };
        if status == libc::EINPROGRESS {
            return None;
        }
        // aio_return must be called exactly once to release the request.
        let ret = unsafe { libc::aio_return(cb) };
        let result = if status == 0 {
            ret as i64
        } else if status > 0 {
            -(status as i64)
        } else {
            -(Errno::last() as i64)
        };
        let slot = op.slot;
        self.ops.swap_remove(idx);
        Some(IoCompletion { slot, result })
    }
}

impl Default for AioDriver {
    fn default() -> Self {
        Self::new(AioDriverConfig::default())
    }
}

impl IoDriver for AioDriver {
    fn submit(&mut self, req: &IoRequest) -> Result<()> {
        if req.fd < 0 || req.ptr.is_null() {
            return Err(OffloadError::InvalidSubmission(libc::EBADF));
        }
        if self.ops.len() >= self.max_inflight {
            return Err(OffloadError::RingFull);
        }

        let mut op = AioOp {
            slot: req.slot,
            cb: Self::control_block(req)?,
        };
        let cb: *mut libc::aiocb = &mut *op.cb;
        // Safety: the control block is boxed (stable address) and kept in
        // `self.ops` until aio_return reaps it; the buffer outlives the slot.
        let ret = unsafe {
            match req.op {
                IoOp::Read => libc::aio_read(cb),
                IoOp::Write => libc::aio_write(cb),
            }
        };
        if ret != 0 {
            return match Errno::last() {
                Errno::EAGAIN => Err(OffloadError::RingFull),
                errno => Err(OffloadError::InvalidSubmission(errno as i32)),
            };
        }
        self.ops.push(op);
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        // aio_read/aio_write already handed the request over.
        Ok(0)
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        let mut count = 0;
        let mut idx = 0;
        while idx < self.ops.len() {
            match self.try_reap(idx) {
                // swap_remove moved a new entry into `idx`; look at it next.
                Some(c) => {
                    out.push(c);
                    count += 1;
                }
                None => idx += 1,
            }
        }
        count
    }

    fn drain_all(&mut self, out: &mut Vec<IoCompletion>) -> Result<()> {
        loop {
            self.poll_completions(out);
            if self.ops.is_empty() {
                return Ok(());
            }
            let list: Vec<*const libc::aiocb> = self
                .ops
                .iter()
                .map(|op| &*op.cb as *const libc::aiocb)
                .collect();
            // Safety: every pointer refers to an outstanding, boxed aiocb.
            let ret = unsafe { libc::aio_suspend(list.as_ptr(), list.len() as libc::c_int, ptr::null()) };
            if ret != 0 {
                match Errno::last() {
                    Errno::EAGAIN | Errno::EINTR => continue,
                    errno => return Err(IoFailure::Os(errno as i32).into()),
                }
            }
        }
    }

    fn inflight(&self) -> usize {
        self.ops.len()
    }

    fn capacity(&self) -> usize {
        self.max_inflight
    }

    fn name(&self) -> &'static str {
        "aio"
    }
}

impl Drop for AioDriver {
    fn drop(&mut self) {
        // The C library still references outstanding control blocks; they
        // must finish before their boxes are freed.
        if !self.ops.is_empty() {
            tracing::warn!(outstanding = self.ops.len(), "aio driver dropped with requests in flight, draining");
            let mut sink = Vec::new();
            if let Err(e) = self.drain_all(&mut sink) {
                tracing::warn!(error = %e, "aio drain on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::unix::io::{AsRawFd, RawFd};

    fn request(slot: u32, op: IoOp, fd: RawFd, offset: u64, buf: &mut [u8]) -> IoRequest {
        IoRequest {
            slot: SlotId(slot),
            op,
            fd,
            offset,
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut driver = AioDriver::default();
        let mut file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        let mut a = vec![1u8; 4096];
        let mut b = vec![2u8; 4096];
        driver.submit(&request(0, IoOp::Write, fd, 0, &mut a)).unwrap();
        driver.submit(&request(1, IoOp::Write, fd, 4096, &mut b)).unwrap();
        assert_eq!(driver.inflight(), 2);

        let mut done = Vec::new();
        driver.drain_all(&mut done).unwrap();
        done.sort_by_key(|c| c.slot);
        assert_eq!(
            done,
            vec![
                IoCompletion { slot: SlotId(0), result: 4096 },
                IoCompletion { slot: SlotId(1), result: 4096 },
            ]
        );
        assert_eq!(driver.inflight(), 0);

        let mut on_disk = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut on_disk).unwrap();
        assert_eq!(&on_disk[..4096], &a[..]);
        assert_eq!(&on_disk[4096..], &b[..]);

        let mut back = vec![0u8; 4096];
        driver.submit(&request(7, IoOp::Read, fd, 4096, &mut back)).unwrap();
        done.clear();
        driver.drain_all(&mut done).unwrap();
        assert_eq!(done[0].slot, SlotId(7));
        assert_eq!(back, b);
    }

    #[test]
    fn test_saturation_is_retryable() {
        let mut driver = AioDriver::new(AioDriverConfig { max_inflight: 1 });
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];

        driver.submit(&request(0, IoOp::Write, fd, 0, &mut a)).unwrap();
        let err = driver.submit(&request(1, IoOp::Write, fd, 512, &mut b)).unwrap_err();
        assert!(err.is_retryable());

        let mut done = Vec::new();
        driver.drain_all(&mut done).unwrap();
        driver.submit(&request(1, IoOp::Write, fd, 512, &mut b)).unwrap();
        driver.drain_all(&mut done).unwrap();
        assert_eq!(done.len(), 2);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let mut driver = AioDriver::default();
        let file = tempfile::tempfile().unwrap();
        let mut buf = vec![0u8; 128];
        driver
            .submit(&request(2, IoOp::Read, file.as_raw_fd(), 0, &mut buf))
            .unwrap();
        let mut done = Vec::new();
        driver.drain_all(&mut done).unwrap();
        assert_eq!(done, vec![IoCompletion { slot: SlotId(2), result: 0 }]);
    }

    #[test]
    fn test_null_buffer_rejected() {
        let mut driver = AioDriver::default();
        let req = IoRequest {
            slot: SlotId(0),
            op: IoOp::Write,
            fd: 0,
            offset: 0,
            ptr: std::ptr::null_mut(),
            len: 16,
        };
        assert!(matches!(driver.submit(&req), Err(OffloadError::InvalidSubmission(_))));
        assert_eq!(driver.inflight(), 0);
    }
}

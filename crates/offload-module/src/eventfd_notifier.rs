//! `EventFd` — completion wakeup for the dispatcher.
//!
//! The uring driver registers this eventfd with its ring
//! (`IORING_REGISTER_EVENTFD`), so the kernel bumps the counter whenever a
//! CQE is posted. The dispatcher sleeps in `wait()` instead of spinning.
//! Coalescing: any number of signals before the consumer drains the
//! counter result in a single wakeup (eventfd counter semantics).

use nix::errno::Errno;
use offload_core::error::{IoFailure, Result};

use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct EventFd {
    fd: RawFd,
    owned: bool, // true if we created the fd (must close on drop)
}

impl EventFd {
    /// Wrap an existing eventfd without taking ownership.
    pub fn borrowed(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    /// Create a new non-blocking eventfd and wrap it.
    ///
    /// The wrapper OWNS the fd and closes it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(IoFailure::Os(Errno::last() as i32).into());
        }
        Ok(Self { fd, owned: true })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter, waking any waiter.
    pub fn signal(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // EAGAIN means the counter would overflow, so a wakeup is
            // already pending.
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(IoFailure::Os(errno as i32).into());
        }
        Ok(())
    }

    /// Wait up to `timeout` for the counter to become non-zero, then reset it.
    ///
    /// Returns true if the eventfd was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !wait_readable(self.fd, timeout) {
            return false;
        }
        self.drain();
        true
    }

    /// Reset the counter to zero. Returns the value read (0 if none).
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

/// `poll(2)` a descriptor for readability.
///
/// Sub-millisecond timeouts round up to 1ms.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
    let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_times_out_without_signal() {
        let efd = EventFd::create().unwrap();
        assert!(!efd.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_signals_coalesce() {
        let efd = EventFd::create().unwrap();
        efd.signal().unwrap();
        efd.signal().unwrap();
        efd.signal().unwrap();
        assert!(wait_readable(efd.fd(), Duration::from_millis(10)));
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_wait_resets_counter() {
        let efd = EventFd::create().unwrap();
        efd.signal().unwrap();
        assert!(efd.wait(Duration::from_millis(10)));
        assert!(!efd.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_borrowed_does_not_close() {
        let owner = EventFd::create().unwrap();
        {
            let view = EventFd::borrowed(owner.fd());
            view.signal().unwrap();
        }
        // fd still open: the owner can drain what the view wrote.
        assert_eq!(owner.drain(), 1);
    }
}

//! I/O driver abstraction.
//!
//! An `IoDriver` wraps one kernel-async facility behind a uniform
//! submit / flush / poll / drain interface.
//!
//! # Implementors
//!
//! - `UringDriver` (default): one io_uring instance. `submit()` pushes an
//!   SQE, `flush()` calls `io_uring_enter()`, `poll_completions()` drains
//!   the CQ. An eventfd registered with the ring signals new CQEs.
//!
//! - `AioDriver`: POSIX AIO. `submit()` calls `aio_read()`/`aio_write()`
//!   directly (flush is a no-op), completions are found by polling
//!   `aio_error()` on every outstanding control block.
//!
//! The engine never names a concrete driver; it holds the `Driver` sum type
//! from `offload-module`, chosen once at construction.

use std::os::unix::io::RawFd;

use crate::entry::{IoCompletion, IoRequest};
use crate::error::Result;

/// Async positioned I/O submission and completion.
///
/// **Contract:**
/// - `submit()` and `flush()` must NEVER block on disk latency.
/// - `submit()` returns `Err(RingFull)` when the driver's own queue is
///   saturated. That is retryable and distinct from engine slot exhaustion.
/// - Invalid fd/offset/length surface as `Err(InvalidSubmission)`, either at
///   submit time or as a negative-errno completion.
/// - Every accepted request produces exactly one `IoCompletion`.
pub trait IoDriver: Send {
    /// Queue a single request. May not reach the kernel until `flush()`.
    fn submit(&mut self, req: &IoRequest) -> Result<()>;

    /// Kick all queued submissions to the kernel.
    ///
    /// Returns the number of entries the kernel accepted.
    fn flush(&mut self) -> Result<usize>;

    /// Append ready completions to `out` (non-blocking).
    ///
    /// Returns the number of completions appended.
    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize;

    /// Block until every outstanding submission has completed, appending
    /// all of them to `out`.
    fn drain_all(&mut self, out: &mut Vec<IoCompletion>) -> Result<()>;

    /// How many operations are in flight (submitted, not yet polled).
    fn inflight(&self) -> usize;

    /// Maximum number of operations the driver can hold at once.
    fn capacity(&self) -> usize;

    /// A descriptor that becomes readable when completions are posted.
    ///
    /// `None` means the dispatcher has to poll on a timer.
    fn completion_fd(&self) -> Option<RawFd> {
        None
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

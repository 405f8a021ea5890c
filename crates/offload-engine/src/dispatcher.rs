//! # The Dispatcher Loop
//!
//! Runs on the dedicated `offload-dispatch` thread:
//!
//! ```text
//! loop {
//!     1. Flush queued submissions, drain driver completions
//!     2. For each completion:
//!          short transfer? → resubmit the remainder on the same slot
//!          else            → storage policy, registry resolve,
//!                            callback, slot release, counters
//!     3. Shutdown requested? → break
//!     4. Idle → wait on the ring eventfd (uring) or sleep (aio)
//! }
//! drain everything still in flight, dispatch it
//! ```

use offload_core::completion::Completion;
use offload_core::entry::{IoCompletion, IoOp, SlotId};
use offload_core::error::{IoFailure, OffloadError};
use offload_core::io_backend::IoDriver;

use offload_module::eventfd_notifier::EventFd;

use crate::engine::{EngineShared, InflightOp};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) fn run(shared: Arc<EngineShared>) {
    let mut completions: Vec<IoCompletion> = Vec::with_capacity(shared.slots.capacity());
    tracing::debug!(backend = %shared.backend, "dispatcher running");

    loop {
        let stopping = shared.shutdown.load(Ordering::Acquire);

        // ── Step 1: flush + poll ──
        {
            let mut driver = shared.driver.lock();
            if let Err(e) = driver.flush() {
                tracing::warn!(error = %e, "driver flush failed");
            }
            driver.poll_completions(&mut completions);
        }

        // ── Step 2: dispatch ──
        let did_work = !completions.is_empty();
        for c in completions.drain(..) {
            handle_completion(&shared, c);
        }

        // ── Step 3: shutdown ──
        if stopping {
            break;
        }

        // ── Step 4: idle ──
        if !did_work {
            match shared.completion_fd {
                Some(fd) => {
                    EventFd::borrowed(fd).wait(shared.config.idle_wait);
                }
                None => std::thread::sleep(shared.config.idle_wait),
            }
        }
    }

    // Shutdown: continuations may queue more work, so drain until empty.
    loop {
        let drained = {
            let mut driver = shared.driver.lock();
            let res = driver.drain_all(&mut completions);
            (res, driver.inflight())
        };
        match drained {
            (Err(e), _) => {
                tracing::error!(error = %e, "driver drain failed at shutdown");
                break;
            }
            (Ok(()), inflight) => {
                let had = !completions.is_empty();
                for c in completions.drain(..) {
                    handle_completion(&shared, c);
                }
                if !had && inflight == 0 {
                    break;
                }
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

fn handle_completion(shared: &EngineShared, c: IoCompletion) {
    let Some(cell) = shared.inflight.get(c.slot.as_usize()) else {
        tracing::error!(slot = %c.slot, "completion for unknown slot");
        return;
    };

    // ── Decide: done, failed, or continue ──
    let outcome = {
        let mut guard = cell.lock();
        let Some(op) = guard.as_mut() else {
            tracing::error!(slot = %c.slot, result = c.result, "completion for idle slot");
            return;
        };

        match c.errno() {
            Some(errno) => Some(Err(IoFailure::Os(errno))),
            None => {
                let n = c.result as usize;
                op.done += n;
                if op.done >= op.len {
                    Some(Ok(op.len))
                } else if n == 0 {
                    Some(Err(IoFailure::ShortTransfer {
                        expected: op.len,
                        transferred: op.done,
                    }))
                } else {
                    let req = op.next_request(c.slot, shared.fd());
                    tracing::debug!(key = %op.key, slot = %c.slot, done = op.done, len = op.len, "short transfer, continuing");
                    drop(guard);
                    match shared.submit_with_retry(&req) {
                        Ok(()) => {
                            shared.stats.continuations.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                        Err(e) => {
                            tracing::warn!(slot = %c.slot, error = %e, "continuation submit failed");
                            Some(Err(continuation_failure(e)))
                        }
                    }
                }
            }
        }
    };

    if let Some(outcome) = outcome {
        if let Some(op) = cell.lock().take() {
            finalize(shared, c.slot, op, outcome);
        }
    }
}

fn continuation_failure(e: OffloadError) -> IoFailure {
    match e {
        OffloadError::Io(failure) => failure,
        OffloadError::InvalidSubmission(errno) => IoFailure::Os(errno),
        _ => IoFailure::Os(libc::EIO),
    }
}

/// Storage policy, bookkeeping, callback and slot release, in that order.
fn finalize(shared: &EngineShared, slot: SlotId, op: InflightOp, outcome: Result<usize, IoFailure>) {
    shared.slots.mark_completed(slot);
    let stats = &shared.stats;

    match (&outcome, op.op) {
        (Ok(n), IoOp::Write) => {
            stats.writes_completed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
            if shared.config.release_after_write {
                op.buffer.release_storage();
            }
        }
        (Ok(n), IoOp::Read) => {
            stats.reads_completed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_read.fetch_add(*n as u64, Ordering::Relaxed);
        }
        (Err(failure), kind) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %op.key, %slot, op = %kind, error = %failure, "request failed");
            if kind == IoOp::Write {
                // Partial data on disk is useless: drop the region, keep storage.
                let mut state = shared.space.lock();
                if state.regions.get(&op.key) == Some(&op.region) {
                    state.regions.remove(&op.key);
                    state.space.free(op.region);
                }
            }
        }
    }

    let completion = Completion {
        key: op.key,
        op: op.op,
        region: op.region,
        outcome,
    };
    // The buffer goes before the callback runs, so a callback may drop the
    // last reference.
    drop(op);

    match shared.registry.resolve(completion.key) {
        Ok(Some(cb)) => {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(&completion))).is_err() {
                stats.callback_panics.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %completion.key, op = %completion.op, "completion callback panicked");
            }
        }
        Ok(None) => {}
        Err(e) => tracing::error!(error = %e, "completion without registration"),
    }

    if let Err(e) = shared.slots.release(slot) {
        tracing::error!(error = %e, "slot release failed");
    }
    shared.finish_outstanding(completion.op);
    tracing::debug!(key = %completion.key, %slot, op = %completion.op, ok = completion.is_success(), "request dispatched");
}

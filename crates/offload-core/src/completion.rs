//! Completion notification.
//!
//! The dispatcher hands every finished request to its callback as a
//! `Completion`: which key, which direction, which region, and whether the
//! full range was transferred. Memory release is not part of the callback;
//! the engine applies its storage policy before invoking it.

use crate::entry::{IoOp, RequestKey};
use crate::error::IoFailure;
use crate::region::Region;

/// Structured result of one dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub key: RequestKey,
    pub op: IoOp,
    pub region: Region,
    /// Bytes transferred on success.
    pub outcome: Result<usize, IoFailure>,
}

impl Completion {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    #[inline]
    pub fn failure(&self) -> Option<IoFailure> {
        self.outcome.err()
    }
}

/// Runs exactly once when its request is dispatched, success or failure.
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Box a closure as a `CompletionCallback`.
pub fn callback<F>(f: F) -> CompletionCallback
where
    F: FnOnce(&Completion) + Send + 'static,
{
    Box::new(f)
}

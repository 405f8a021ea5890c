//! Offload error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::entry::{RequestKey, SlotId};

/// Construction-time failures. Always fatal for the offloader being built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("offload directory {0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),
    #[error("unsupported backend {0:?} (expected \"uring\" or \"aio\")")]
    UnsupportedBackend(String),
    #[error("n_entries must be a positive integer")]
    ZeroEntries,
    #[error("failed to create backing file {path:?}: {reason}")]
    BackingFile { path: PathBuf, reason: String },
    #[error("{backend} backend setup failed: {}", io::Error::from_raw_os_error(*.errno))]
    BackendSetup { backend: BackendKind, errno: i32 },
}

/// Why a submitted request did not transfer its full range.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum IoFailure {
    #[error("short transfer: {transferred} of {expected} bytes")]
    ShortTransfer { expected: usize, transferred: usize },
    #[error("device error: {}", io::Error::from_raw_os_error(*.0))]
    Os(i32),
    #[error("driver still saturated after {0} submission attempts")]
    Saturated(u32),
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A second operation was issued for a key that is still pending.
    #[error("request key {0} already has an operation in flight")]
    DuplicateKey(RequestKey),
    #[error("request key {0} is not pending")]
    NotPending(RequestKey),
    /// Read of a key that was never written (or whose region was released).
    #[error("no offloaded region tracked for key {0}")]
    UnknownRegion(RequestKey),
    #[error("region for key {key} holds {expected} bytes, buffer has {actual}")]
    RegionMismatch { key: RequestKey, expected: u64, actual: u64 },
    #[error("region for key {0} cannot be released while an operation is pending")]
    RegionBusy(RequestKey),
    #[error("buffer for key {0} has no storage")]
    EmptyBuffer(RequestKey),
    #[error("slot {0} released twice")]
    DoubleRelease(SlotId),
    /// Driver submission queue is full. Retryable.
    #[error("driver submission queue full")]
    RingFull,
    /// The driver rejected fd/offset/length. Indicates a bookkeeping bug.
    #[error("invalid submission: {}", io::Error::from_raw_os_error(*.0))]
    InvalidSubmission(i32),
    #[error(transparent)]
    Io(#[from] IoFailure),
    /// A blocking call was made from inside a completion callback.
    #[error("blocking offload call from the completion dispatcher thread")]
    DispatcherReentry,
}

impl OffloadError {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OffloadError::RingFull)
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(OffloadError::RingFull.is_retryable());
        assert!(!OffloadError::InvalidSubmission(22).is_retryable());
        assert!(!OffloadError::DuplicateKey(RequestKey(1)).is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = OffloadError::UnknownRegion(RequestKey(9));
        assert_eq!(err.to_string(), "no offloaded region tracked for key 9");

        let err: OffloadError = IoFailure::ShortTransfer { expected: 8, transferred: 3 }.into();
        assert_eq!(err.to_string(), "short transfer: 3 of 8 bytes");

        let err: OffloadError = ConfigError::ZeroEntries.into();
        assert!(matches!(err, OffloadError::Config(ConfigError::ZeroEntries)));
    }
}

//! Library defaults for `OffloadConfig`.

/// Request slots (and therefore max in-flight requests).
pub const N_ENTRIES: usize = 128;

/// Backend name, parsed into `BackendKind`.
pub const BACKEND: &str = "uring";

/// Dispatcher idle wait between completion polls, in microseconds.
pub const IDLE_WAIT_US: u64 = 100;

/// Submission attempts after the first `RingFull` before giving up.
pub const MAX_SUBMIT_RETRIES: u32 = 16;

/// Free buffer storage once its write has completed.
pub const RELEASE_AFTER_WRITE: bool = true;

/// Upper bound of the submit backoff.
pub const MAX_BACKOFF_US: u64 = 10_000;

/// First submit backoff step.
pub const MIN_BACKOFF_US: u64 = 10;

/// Largest byte count handed to the kernel in one request.
pub const MAX_IO_CHUNK: usize = 0x7fff_f000;

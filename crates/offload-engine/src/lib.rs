//! # offload-engine — Asynchronous disk offload
//!
//! Moves buffers out to an append-style backing file and back, through a
//! bounded pool of in-flight requests on io_uring or POSIX AIO.
//!
//! ```text
//! Offloader ── SlotPool (N slots, blocks when exhausted)
//!     │     ── RequestRegistry (one pending op per key)
//!     │     ── SpaceManager + region map
//!     └──── Driver { Uring | Aio } ◄── offload-dispatch thread
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use offload_engine::{OffloadConfig, Offloader};
//! use offload_module::host_buffer::HostBuffer;
//!
//! let off = Offloader::new(OffloadConfig::from_env()?)?;
//! let buf = Arc::new(HostBuffer::from_bytes(data));
//! off.sync_write(buf.clone(), buf.key())?;   // storage released
//! off.sync_read(buf.clone(), buf.key())?;    // storage restored
//! ```

pub mod config;
pub mod engine;
pub mod logging;

mod dispatcher;

pub use config::{OffloadConfig, ReadAllocation};
pub use engine::{OffloadStats, Offloader};

pub use offload_core::backend::BackendKind;
pub use offload_core::buffer::OffloadBuffer;
pub use offload_core::completion::{callback, Completion, CompletionCallback};
pub use offload_core::entry::{IoOp, RequestKey};
pub use offload_core::error::{ConfigError, IoFailure, OffloadError, Result};
pub use offload_core::region::Region;

//! # offload-module — Default (safe) implementations
//!
//! This crate provides the default implementation for every offload
//! trait, plus the bookkeeping structures the engine composes.
//! Each impl prioritizes correctness and simplicity over performance.
//!
//! ## Default stack
//!
//! | Concern            | Default Impl      | Alternative            |
//! |--------------------|-------------------|------------------------|
//! | IoDriver           | UringDriver       | AioDriver (`aio`)      |
//! | OffloadBuffer      | HostBuffer        | runtime-owned storage  |
//! | Completion wakeup  | EventFd           | timed poll (AIO)       |
//! | Slot allocation    | SlotPool          |                        |
//! | Key tracking       | RequestRegistry   |                        |
//! | File space         | SpaceManager      |                        |

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("offload-module requires Linux (io_uring and glibc POSIX AIO)");
    }
}

pub mod uring_driver;
pub mod aio_driver;
pub mod driver;
pub mod eventfd_notifier;
pub mod slot_pool;
pub mod registry;
pub mod space;
pub mod host_buffer;

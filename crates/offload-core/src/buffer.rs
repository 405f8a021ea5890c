//! Buffer storage abstraction.
//!
//! An `OffloadBuffer` is the engine's view of a tensor's backing memory:
//! a byte length that never changes, plus storage that can be released
//! (after its data reached the disk) and re-allocated (before a read
//! lands in it).
//!
//! # Implementors
//!
//! - `HostBuffer` (default): heap storage behind a lock, keyed by a
//!   monotonic, never-reused `RequestKey`.
//!
//! - Runtime-owned buffers (e.g. a tensor library's storage) implement this
//!   trait in the glue layer that owns them.

/// Storage the engine reads from and writes into.
///
/// **Contract:**
/// - `data_ptr()` points to `storage_len()` writable bytes, or is null when
///   storage is released.
/// - The pointer stays valid while a request on this buffer is in flight.
///   The engine never calls `release_storage()`/`allocate_storage()` during
///   that span, and callers must not either.
/// - `allocate_storage()` leaves `storage_len() == nbytes()`.
pub trait OffloadBuffer: Send + Sync {
    /// Logical size in bytes (what a read restores).
    fn nbytes(&self) -> usize;

    /// Bytes currently backed by memory. Zero when released.
    fn storage_len(&self) -> usize;

    /// Start of the storage, or null when released.
    fn data_ptr(&self) -> *mut u8;

    /// Free the backing memory. Idempotent.
    fn release_storage(&self);

    /// Allocate backing memory of `nbytes()` bytes. No-op if present.
    fn allocate_storage(&self);

    #[inline]
    fn has_storage(&self) -> bool {
        self.storage_len() > 0
    }
}

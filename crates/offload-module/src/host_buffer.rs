//! `HostBuffer` — default `OffloadBuffer` implementation.
//!
//! Storage is a plain heap allocation (`Box<[u8]>`) that can be dropped
//! and re-created while the logical size stays fixed. Each buffer carries
//! a `RequestKey` drawn from a process-wide counter, so keys are never
//! reused for the life of the process.

use offload_core::buffer::OffloadBuffer;
use offload_core::entry::RequestKey;

use parking_lot::Mutex;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

pub struct HostBuffer {
    key: RequestKey,
    nbytes: usize,
    storage: Mutex<Option<Box<[u8]>>>,
}

impl HostBuffer {
    /// Zero-filled buffer of `nbytes` bytes.
    pub fn new(nbytes: usize) -> Self {
        Self::with_storage(nbytes, Some(vec![0u8; nbytes].into_boxed_slice()))
    }

    /// Buffer taking ownership of `data`.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let nbytes = data.len();
        Self::with_storage(nbytes, Some(data.into_boxed_slice()))
    }

    /// Buffer of `nbytes` logical bytes with no storage yet. A read
    /// allocates it.
    pub fn unallocated(nbytes: usize) -> Self {
        Self::with_storage(nbytes, None)
    }

    fn with_storage(nbytes: usize, storage: Option<Box<[u8]>>) -> Self {
        Self {
            key: RequestKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed)),
            nbytes,
            storage: Mutex::new(storage),
        }
    }

    #[inline]
    pub fn key(&self) -> RequestKey {
        self.key
    }

    /// Copy of the current contents. `None` when storage is released.
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        self.storage.lock().as_deref().map(<[u8]>::to_vec)
    }

    /// Run `f` over the contents, if present.
    ///
    /// Must not be called while a request on this buffer is in flight.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.storage.lock().as_deref_mut().map(f)
    }
}

impl OffloadBuffer for HostBuffer {
    #[inline]
    fn nbytes(&self) -> usize {
        self.nbytes
    }

    fn storage_len(&self) -> usize {
        self.storage.lock().as_ref().map_or(0, |s| s.len())
    }

    fn data_ptr(&self) -> *mut u8 {
        // The boxed slice never moves while it exists; callers uphold the
        // no-release-while-in-flight contract.
        self.storage
            .lock()
            .as_mut()
            .map_or(std::ptr::null_mut(), |s| s.as_mut_ptr())
    }

    fn release_storage(&self) {
        self.storage.lock().take();
    }

    fn allocate_storage(&self) {
        let mut storage = self.storage.lock();
        if storage.is_none() {
            *storage = Some(vec![0u8; self.nbytes].into_boxed_slice());
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("key", &self.key)
            .field("nbytes", &self.nbytes)
            .field("storage_len", &self.storage_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_unique_and_increasing() {
        let a = HostBuffer::new(8);
        let b = HostBuffer::new(8);
        let c = HostBuffer::unallocated(8);
        assert!(a.key() < b.key());
        assert!(b.key() < c.key());
    }

    #[test]
    fn test_release_and_allocate() {
        let buf = HostBuffer::from_bytes(vec![9u8; 32]);
        assert_eq!(buf.nbytes(), 32);
        assert_eq!(buf.storage_len(), 32);
        assert!(!buf.data_ptr().is_null());

        buf.release_storage();
        assert_eq!(buf.storage_len(), 0);
        assert!(!buf.has_storage());
        assert!(buf.data_ptr().is_null());
        assert_eq!(buf.nbytes(), 32);
        assert!(buf.to_vec().is_none());

        // Idempotent.
        buf.release_storage();

        buf.allocate_storage();
        assert_eq!(buf.storage_len(), 32);
        assert_eq!(buf.to_vec().unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn test_allocate_keeps_existing_data() {
        let buf = HostBuffer::from_bytes(vec![1, 2, 3]);
        buf.allocate_storage();
        assert_eq!(buf.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_with_data() {
        let buf = HostBuffer::new(4);
        buf.with_data(|d| d.copy_from_slice(&[4, 3, 2, 1]));
        assert_eq!(buf.to_vec().unwrap(), vec![4, 3, 2, 1]);

        let empty = HostBuffer::unallocated(4);
        assert!(empty.with_data(|d| d.len()).is_none());
    }
}

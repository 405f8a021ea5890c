//! `RequestRegistry` — pending request keys and their callbacks.
//!
//! A key is present for the whole span between submission and completion
//! dispatch. Registering a key that is still pending is a protocol
//! violation and fails with `DuplicateKey`; nothing is overwritten.

use offload_core::entry::RequestKey;
use offload_core::error::{OffloadError, Result};

use parking_lot::Mutex;

use std::collections::HashMap;
use std::time::Instant;

struct Pending<C> {
    callback: Option<C>,
    since: Instant,
}

/// Maps request keys to their pending callback.
///
/// Generic over the callback type so the engine can store
/// `CompletionCallback`s while tests use plain values.
pub struct RequestRegistry<C> {
    entries: Mutex<HashMap<RequestKey, Pending<C>>>,
}

impl<C> RequestRegistry<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Mark `key` pending with an optional callback.
    pub fn register(&self, key: RequestKey, callback: Option<C>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(OffloadError::DuplicateKey(key));
        }
        entries.insert(
            key,
            Pending {
                callback,
                since: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove `key` and hand back its callback (if one was registered).
    pub fn resolve(&self, key: RequestKey) -> Result<Option<C>> {
        let pending = self
            .entries
            .lock()
            .remove(&key)
            .ok_or(OffloadError::NotPending(key))?;
        tracing::trace!(%key, pending_us = pending.since.elapsed().as_micros() as u64, "request resolved");
        Ok(pending.callback)
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the pending keys, in no particular order.
    pub fn pending_keys(&self) -> Vec<RequestKey> {
        self.entries.lock().keys().copied().collect()
    }
}

impl<C> Default for RequestRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for RequestRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

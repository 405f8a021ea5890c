//! `Offloader` — the public façade.
//!
//! ```text
//!   caller thread                          offload-dispatch thread
//!   ─────────────                          ───────────────────────
//!   register key ─┐                        flush + poll driver
//!   reserve region│                        ├─ short? resubmit remainder
//!   acquire slot  │  IoRequest             ├─ storage policy
//!   submit ───────┴──────► Driver ───────► ├─ callback(&Completion)
//!   return                                 └─ release slot
//! ```
//!
//! One backing file per offloader, one dispatcher thread, N slots.

use offload_core::backend::BackendKind;
use offload_core::buffer::OffloadBuffer;
use offload_core::completion::{callback, Completion, CompletionCallback};
use offload_core::entry::{IoOp, IoRequest, RequestKey, SlotId};
use offload_core::error::{ConfigError, IoFailure, OffloadError, Result};
use offload_core::io_backend::IoDriver;
use offload_core::region::Region;

use offload_module::driver::Driver;
use offload_module::eventfd_notifier::EventFd;
use offload_module::registry::RequestRegistry;
use offload_module::slot_pool::SlotPool;
use offload_module::space::SpaceManager;

use crate::config::{defaults, OffloadConfig, ReadAllocation};
use crate::dispatcher;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// A submitted request, owned by its slot until dispatch.
pub(crate) struct InflightOp {
    pub key: RequestKey,
    pub op: IoOp,
    pub region: Region,
    /// Keeps `ptr` alive.
    pub buffer: Arc<dyn OffloadBuffer>,
    pub ptr: *mut u8,
    pub len: usize,
    /// Bytes confirmed so far across continuations.
    pub done: usize,
}

// Safety: `ptr` points into `buffer`'s storage, which the Arc keeps alive
// and which nobody releases while the request is in flight.
unsafe impl Send for InflightOp {}

impl InflightOp {
    /// Request for the bytes not yet transferred, capped at one chunk.
    pub fn next_request(&self, slot: SlotId, fd: RawFd) -> IoRequest {
        let remaining = self.len - self.done;
        IoRequest {
            slot,
            op: self.op,
            fd,
            offset: self.region.offset + self.done as u64,
            // Safety: done < len, so the pointer stays inside the storage.
            ptr: unsafe { self.ptr.add(self.done) },
            len: remaining.min(defaults::MAX_IO_CHUNK),
        }
    }
}

/// Region map and file space, locked together.
pub(crate) struct SpaceState {
    pub regions: HashMap<RequestKey, Region>,
    pub space: SpaceManager,
}

#[derive(Debug, Default)]
pub(crate) struct Outstanding {
    pub reads: usize,
    pub writes: usize,
}

impl Outstanding {
    fn count_mut(&mut self, op: IoOp) -> &mut usize {
        match op {
            IoOp::Read => &mut self.reads,
            IoOp::Write => &mut self.writes,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    pub writes_submitted: AtomicU64,
    pub reads_submitted: AtomicU64,
    pub writes_completed: AtomicU64,
    pub reads_completed: AtomicU64,
    pub failures: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub continuations: AtomicU64,
    pub submit_retries: AtomicU64,
    pub callback_panics: AtomicU64,
}

/// Point-in-time counters returned by `Offloader::stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub writes_submitted: u64,
    pub reads_submitted: u64,
    pub writes_completed: u64,
    pub reads_completed: u64,
    pub failures: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Resubmissions after a short transfer.
    pub continuations: u64,
    pub submit_retries: u64,
    pub callback_panics: u64,
    pub slots_high_water: usize,
    /// End of the furthest region ever allocated in the backing file.
    pub file_cursor: u64,
    pub free_bytes: u64,
}

/// State shared between the façade and the dispatcher thread.
pub(crate) struct EngineShared {
    pub config: OffloadConfig,
    pub path: PathBuf,
    pub file: File,
    pub backend: BackendKind,
    pub driver: Mutex<Driver>,
    pub completion_fd: Option<RawFd>,
    pub slots: SlotPool,
    pub inflight: Box<[Mutex<Option<InflightOp>>]>,
    pub registry: RequestRegistry<CompletionCallback>,
    pub space: Mutex<SpaceState>,
    pub outstanding: Mutex<Outstanding>,
    pub drained: Condvar,
    pub stats: EngineStats,
    pub shutdown: AtomicBool,
    pub dispatcher_id: OnceLock<ThreadId>,
}

impl EngineShared {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn on_dispatcher_thread(&self) -> bool {
        self.dispatcher_id.get() == Some(&thread::current().id())
    }

    /// Submit `req`, backing off while the driver reports saturation.
    pub fn submit_with_retry(&self, req: &IoRequest) -> Result<()> {
        submit_with_backoff(
            &self.driver,
            req,
            self.config.max_submit_retries,
            &self.stats.submit_retries,
        )
    }

    /// Count a dispatched request out and wake synchronizers.
    pub fn finish_outstanding(&self, op: IoOp) {
        let mut outstanding = self.outstanding.lock();
        let count = outstanding.count_mut(op);
        *count = count.saturating_sub(1);
        self.drained.notify_all();
    }

    /// Wake the dispatcher early (shutdown).
    pub fn wake_dispatcher(&self) {
        if let Some(fd) = self.completion_fd {
            if let Err(e) = EventFd::borrowed(fd).signal() {
                tracing::debug!(error = %e, "dispatcher wakeup failed");
            }
        }
    }

    fn wait_outstanding(&self, done: impl Fn(&Outstanding) -> bool) -> Result<()> {
        if self.on_dispatcher_thread() {
            return Err(OffloadError::DispatcherReentry);
        }
        let mut outstanding = self.outstanding.lock();
        while !done(&outstanding) {
            self.drained.wait(&mut outstanding);
        }
        Ok(())
    }
}

/// Submit to `driver`, retrying `RingFull` with exponential backoff.
///
/// Gives up with `IoFailure::Saturated` after `max_retries` retries.
pub(crate) fn submit_with_backoff<D: IoDriver>(
    driver: &Mutex<D>,
    req: &IoRequest,
    max_retries: u32,
    retries: &AtomicU64,
) -> Result<()> {
    let max_backoff = Duration::from_micros(defaults::MAX_BACKOFF_US);
    let mut backoff = Duration::from_micros(defaults::MIN_BACKOFF_US);
    let mut attempts: u32 = 0;

    loop {
        let mut guard = driver.lock();
        match guard.submit(req) {
            Ok(()) => {
                if let Err(e) = guard.flush() {
                    // The request stays queued; the dispatcher flushes again.
                    tracing::warn!(slot = %req.slot, error = %e, "driver flush failed");
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                // Push out what is queued so the kernel can make room.
                if let Err(e) = guard.flush() {
                    tracing::warn!(slot = %req.slot, error = %e, "driver flush failed while saturated");
                }
                drop(guard);

                attempts += 1;
                if attempts > max_retries {
                    tracing::warn!(slot = %req.slot, attempts, "driver saturated, giving up");
                    return Err(IoFailure::Saturated(attempts).into());
                }
                retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(slot = %req.slot, attempts, ?backoff, "driver saturated, retrying");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome handoff for the synchronous variants.
#[derive(Default)]
struct SyncWait {
    outcome: Mutex<Option<std::result::Result<usize, IoFailure>>>,
    done: Condvar,
}

impl SyncWait {
    fn complete(&self, outcome: std::result::Result<usize, IoFailure>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> std::result::Result<usize, IoFailure> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Offloads buffers to one backing file and restores them.
///
/// All methods take `&self`; share an offloader across threads with `Arc`.
/// Dropping it waits for every outstanding request.
pub struct Offloader {
    shared: Arc<EngineShared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Offloader {
    /// Validate `config`, bring up the backend, create the backing file
    /// and start the dispatcher thread.
    pub fn new(config: OffloadConfig) -> Result<Self> {
        config.validate()?;

        let driver = Driver::for_backend(config.backend, config.n_entries)?;
        let (path, file) = create_backing_file(&config.directory)?;
        let completion_fd = driver.completion_fd();
        let n = config.n_entries;

        let shared = Arc::new(EngineShared {
            backend: driver.kind(),
            driver: Mutex::new(driver),
            completion_fd,
            slots: SlotPool::new(n),
            inflight: (0..n).map(|_| Mutex::new(None)).collect(),
            registry: RequestRegistry::with_capacity(n),
            space: Mutex::new(SpaceState {
                regions: HashMap::new(),
                space: SpaceManager::new(),
            }),
            outstanding: Mutex::new(Outstanding::default()),
            drained: Condvar::new(),
            stats: EngineStats::default(),
            shutdown: AtomicBool::new(false),
            dispatcher_id: OnceLock::new(),
            path,
            file,
            config,
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("offload-dispatch".into())
                .spawn(move || dispatcher::run(shared))
                .map_err(|e| IoFailure::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?
        };
        let _ = shared.dispatcher_id.set(handle.thread().id());

        tracing::info!(
            path = %shared.path.display(),
            backend = %shared.backend,
            n_entries = n,
            "offloader started"
        );

        Ok(Self {
            shared,
            dispatcher: Some(handle),
        })
    }

    /// Write the buffer's storage to a fresh region for `key`.
    ///
    /// Returns once the request is submitted. On success the dispatcher
    /// applies the storage policy (release after write) before invoking
    /// `callback`. A key that already owns a region gets a new one; the old
    /// range is reused later.
    pub fn async_write(
        &self,
        buffer: Arc<dyn OffloadBuffer>,
        key: RequestKey,
        callback: Option<CompletionCallback>,
    ) -> Result<()> {
        let len = buffer.storage_len();
        if len == 0 {
            return Err(OffloadError::EmptyBuffer(key));
        }
        self.shared.registry.register(key, callback)?;

        let (region, previous) = {
            let mut state = self.shared.space.lock();
            let region = state.space.alloc(len as u64);
            let previous = state.regions.insert(key, region);
            (region, previous)
        };

        match self.submit(buffer, key, IoOp::Write, region) {
            Ok(()) => {
                if let Some(old) = previous {
                    self.shared.space.lock().space.free(old);
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.shared.space.lock();
                    match previous {
                        Some(old) => state.regions.insert(key, old),
                        None => state.regions.remove(&key),
                    };
                    state.space.free(region);
                }
                let _ = self.shared.registry.resolve(key);
                Err(e)
            }
        }
    }

    /// Read `key`'s region back into the buffer's storage.
    ///
    /// Released storage is allocated first (or rejected, per
    /// `ReadAllocation`). The storage length must match the region.
    pub fn async_read(
        &self,
        buffer: Arc<dyn OffloadBuffer>,
        key: RequestKey,
        callback: Option<CompletionCallback>,
    ) -> Result<()> {
        self.shared.registry.register(key, callback)?;
        let prepared = self.prepare_read(&buffer, key);
        let result = prepared.and_then(|region| self.submit(buffer, key, IoOp::Read, region));
        if result.is_err() {
            // Never submitted: drop the registration, callback unrun.
            let _ = self.shared.registry.resolve(key);
        }
        result
    }

    fn prepare_read(&self, buffer: &Arc<dyn OffloadBuffer>, key: RequestKey) -> Result<Region> {
        let region = self
            .region(key)
            .ok_or(OffloadError::UnknownRegion(key))?;

        if !buffer.has_storage() {
            match self.shared.config.read_allocation {
                ReadAllocation::Allocate => buffer.allocate_storage(),
                ReadAllocation::Reject => return Err(OffloadError::EmptyBuffer(key)),
            }
        }
        let actual = buffer.storage_len() as u64;
        if actual != region.len {
            return Err(OffloadError::RegionMismatch {
                key,
                expected: region.len,
                actual,
            });
        }
        Ok(region)
    }

    /// Slot, in-flight record and driver submission for a registered key.
    ///
    /// On error everything this function took is given back; the caller
    /// still owns the registration.
    fn submit(&self, buffer: Arc<dyn OffloadBuffer>, key: RequestKey, op: IoOp, region: Region) -> Result<()> {
        let shared = &self.shared;
        let slot = if shared.on_dispatcher_thread() {
            // Blocking here would wait on the thread that frees slots.
            shared.slots.try_acquire().ok_or(OffloadError::DispatcherReentry)?
        } else {
            shared.slots.acquire()
        };

        let ptr = buffer.data_ptr();
        let inflight = InflightOp {
            key,
            op,
            region,
            buffer,
            ptr,
            len: region.len as usize,
            done: 0,
        };
        let req = inflight.next_request(slot, shared.fd());
        *shared.inflight[slot.as_usize()].lock() = Some(inflight);
        *shared.outstanding.lock().count_mut(op) += 1;
        shared.slots.mark_in_flight(slot);

        match shared.submit_with_retry(&req) {
            Ok(()) => {
                let submitted = match op {
                    IoOp::Write => &shared.stats.writes_submitted,
                    IoOp::Read => &shared.stats.reads_submitted,
                };
                submitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, %slot, %op, %region, "request submitted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%key, %slot, %op, error = %e, "submission failed");
                shared.inflight[slot.as_usize()].lock().take();
                if let Err(release_err) = shared.slots.release(slot) {
                    tracing::error!(%slot, error = %release_err, "slot release after failed submit");
                }
                shared.finish_outstanding(op);
                Err(e)
            }
        }
    }

    /// `async_write` and wait for the dispatcher to finish it.
    ///
    /// Not callable from a completion callback.
    pub fn sync_write(&self, buffer: Arc<dyn OffloadBuffer>, key: RequestKey) -> Result<()> {
        self.sync_op(key, |cb| self.async_write(buffer, key, Some(cb)))
    }

    /// `async_read` and wait for the dispatcher to finish it.
    ///
    /// Not callable from a completion callback.
    pub fn sync_read(&self, buffer: Arc<dyn OffloadBuffer>, key: RequestKey) -> Result<()> {
        self.sync_op(key, |cb| self.async_read(buffer, key, Some(cb)))
    }

    fn sync_op(&self, key: RequestKey, start: impl FnOnce(CompletionCallback) -> Result<()>) -> Result<()> {
        if self.shared.on_dispatcher_thread() {
            return Err(OffloadError::DispatcherReentry);
        }
        let wait = Arc::new(SyncWait::default());
        let signal = wait.clone();
        start(callback(move |c: &Completion| signal.complete(c.outcome)))?;
        let transferred = wait.wait()?;
        tracing::trace!(%key, transferred, "sync request done");
        Ok(())
    }

    /// Forget `key`'s region and hand its space back for reuse.
    pub fn release_region(&self, key: RequestKey) -> Result<Region> {
        let mut state = self.shared.space.lock();
        if self.shared.registry.contains(key) {
            return Err(OffloadError::RegionBusy(key));
        }
        let region = state
            .regions
            .remove(&key)
            .ok_or(OffloadError::UnknownRegion(key))?;
        state.space.free(region);
        tracing::debug!(%key, %region, "region released");
        Ok(region)
    }

    /// Region currently tracked for `key`.
    pub fn region(&self, key: RequestKey) -> Option<Region> {
        self.shared.space.lock().regions.get(&key).copied()
    }

    /// Block until every submitted request has been dispatched.
    pub fn synchronize(&self) -> Result<()> {
        self.shared.wait_outstanding(|o| o.reads == 0 && o.writes == 0)
    }

    /// Block until every submitted write has been dispatched.
    pub fn synchronize_writes(&self) -> Result<()> {
        self.shared.wait_outstanding(|o| o.writes == 0)
    }

    /// Block until every submitted read has been dispatched.
    pub fn synchronize_reads(&self) -> Result<()> {
        self.shared.wait_outstanding(|o| o.reads == 0)
    }

    pub fn stats(&self) -> OffloadStats {
        let s = &self.shared.stats;
        let (file_cursor, free_bytes) = {
            let state = self.shared.space.lock();
            (state.space.cursor(), state.space.free_bytes())
        };
        OffloadStats {
            writes_submitted: s.writes_submitted.load(Ordering::Relaxed),
            reads_submitted: s.reads_submitted.load(Ordering::Relaxed),
            writes_completed: s.writes_completed.load(Ordering::Relaxed),
            reads_completed: s.reads_completed.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            bytes_read: s.bytes_read.load(Ordering::Relaxed),
            continuations: s.continuations.load(Ordering::Relaxed),
            submit_retries: s.submit_retries.load(Ordering::Relaxed),
            callback_panics: s.callback_panics.load(Ordering::Relaxed),
            slots_high_water: self.shared.slots.high_water(),
            file_cursor,
            free_bytes,
        }
    }

    pub fn backing_path(&self) -> &Path {
        &self.shared.path
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.backend
    }

    /// Slot capacity N.
    pub fn capacity(&self) -> usize {
        self.shared.slots.capacity()
    }

    /// Keys with an operation not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.registry.len()
    }

    /// Slots currently not free.
    pub fn slots_in_use(&self) -> usize {
        self.shared.slots.in_use()
    }
}

impl Drop for Offloader {
    fn drop(&mut self) {
        let on_dispatcher = self.shared.on_dispatcher_thread();
        if !on_dispatcher {
            // Cannot fail off the dispatcher thread.
            let _ = self.synchronize();
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_dispatcher();

        if let Some(handle) = self.dispatcher.take() {
            if on_dispatcher {
                // Last handle dropped inside a callback; the loop exits on
                // its own once this callback returns.
                return;
            }
            if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
        tracing::info!(path = %self.shared.path.display(), "offloader stopped");
    }
}

impl std::fmt::Debug for Offloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offloader")
            .field("path", &self.shared.path)
            .field("backend", &self.shared.backend)
            .field("capacity", &self.capacity())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Create `offload-<uuid>` in `dir`, exclusively.
fn create_backing_file(dir: &Path) -> Result<(PathBuf, File)> {
    loop {
        let path = dir.join(format!("offload-{}", Uuid::new_v4().simple()));
        match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(ConfigError::BackingFile {
                    path,
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_module::host_buffer::HostBuffer;
    use std::sync::atomic::AtomicUsize;

    fn aio_offloader(dir: &Path, n: usize) -> Offloader {
        Offloader::new(OffloadConfig::new(dir).n_entries(n).backend(BackendKind::Aio)).unwrap()
    }

    #[test]
    fn test_backing_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let off = aio_offloader(dir.path(), 4);
            assert_eq!(off.backend(), BackendKind::Aio);
            assert_eq!(off.capacity(), 4);
            let path = off.backing_path().to_path_buf();
            assert!(path.exists());
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("offload-"));
            assert_eq!(name.len(), "offload-".len() + 32);
            path
        };
        // Left in place after drop.
        assert!(path.exists());
    }

    #[test]
    fn test_two_offloaders_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = aio_offloader(dir.path(), 1);
        let b = aio_offloader(dir.path(), 1);
        assert_ne!(a.backing_path(), b.backing_path());
    }

    #[test]
    fn test_missing_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Offloader::new(OffloadConfig::new(dir.path().join("absent"))).unwrap_err();
        assert!(matches!(err, OffloadError::Config(ConfigError::NotADirectory(_))));
    }

    #[test]
    fn test_empty_buffer_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let buf = Arc::new(HostBuffer::unallocated(64));
        let err = off.async_write(buf.clone(), buf.key(), None).unwrap_err();
        assert!(matches!(err, OffloadError::EmptyBuffer(k) if k == buf.key()));
        assert_eq!(off.pending(), 0);
    }

    #[test]
    fn test_sync_roundtrip_and_storage_policy() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let buf = Arc::new(HostBuffer::from_bytes(data.clone()));
        let key = buf.key();

        off.sync_write(buf.clone(), key).unwrap();
        assert_eq!(buf.storage_len(), 0);
        assert_eq!(off.region(key), Some(Region::new(0, 8192)));

        off.sync_read(buf.clone(), key).unwrap();
        assert_eq!(buf.to_vec().unwrap(), data);

        let stats = off.stats();
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.reads_completed, 1);
        assert_eq!(stats.bytes_written, 8192);
        assert_eq!(stats.bytes_read, 8192);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_keep_storage_when_release_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let off = Offloader::new(
            OffloadConfig::new(dir.path())
                .n_entries(2)
                .backend(BackendKind::Aio)
                .release_after_write(false),
        )
        .unwrap();
        let buf = Arc::new(HostBuffer::from_bytes(vec![3u8; 100]));
        off.sync_write(buf.clone(), buf.key()).unwrap();
        assert_eq!(buf.to_vec().unwrap(), vec![3u8; 100]);
    }

    #[test]
    fn test_read_reject_policy() {
        let dir = tempfile::tempdir().unwrap();
        let off = Offloader::new(
            OffloadConfig::new(dir.path())
                .n_entries(2)
                .backend(BackendKind::Aio)
                .read_allocation(ReadAllocation::Reject),
        )
        .unwrap();
        let buf = Arc::new(HostBuffer::from_bytes(vec![1u8; 16]));
        off.sync_write(buf.clone(), buf.key()).unwrap();
        let err = off.sync_read(buf.clone(), buf.key()).unwrap_err();
        assert!(matches!(err, OffloadError::EmptyBuffer(_)));
        // The failed read left nothing pending.
        assert_eq!(off.pending(), 0);
    }

    #[test]
    fn test_region_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let key = RequestKey(42);
        off.sync_write(Arc::new(HostBuffer::new(64)), key).unwrap();

        let err = off.sync_read(Arc::new(HostBuffer::new(32)), key).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::RegionMismatch { expected: 64, actual: 32, .. }
        ));
    }

    #[test]
    fn test_rewrite_replaces_region() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let key = RequestKey(5);

        off.sync_write(Arc::new(HostBuffer::from_bytes(vec![1u8; 128])), key).unwrap();
        assert_eq!(off.region(key), Some(Region::new(0, 128)));
        off.sync_write(Arc::new(HostBuffer::from_bytes(vec![2u8; 128])), key).unwrap();
        assert_eq!(off.region(key), Some(Region::new(128, 128)));
        assert_eq!(off.stats().free_bytes, 128);

        let back = Arc::new(HostBuffer::unallocated(128));
        off.sync_read(back.clone(), key).unwrap();
        assert_eq!(back.to_vec().unwrap(), vec![2u8; 128]);
    }

    #[test]
    fn test_release_region() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let key = RequestKey(1);
        assert!(matches!(off.release_region(key), Err(OffloadError::UnknownRegion(_))));

        off.sync_write(Arc::new(HostBuffer::new(512)), key).unwrap();
        assert_eq!(off.release_region(key).unwrap(), Region::new(0, 512));
        assert!(off.region(key).is_none());
        assert!(matches!(
            off.sync_read(Arc::new(HostBuffer::new(512)), key),
            Err(OffloadError::UnknownRegion(_))
        ));
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);
        let buf = Arc::new(HostBuffer::new(64));
        off.async_write(buf.clone(), buf.key(), Some(callback(|_| panic!("boom"))))
            .unwrap();
        off.synchronize().unwrap();
        assert_eq!(off.stats().callback_panics, 1);

        // Dispatcher still serves requests.
        let other = Arc::new(HostBuffer::new(64));
        off.sync_write(other.clone(), other.key()).unwrap();
        assert_eq!(off.slots_in_use(), 0);
    }

    #[test]
    fn test_sync_from_callback_is_reentry() {
        let dir = tempfile::tempdir().unwrap();
        let off = Arc::new(aio_offloader(dir.path(), 2));
        let saw_reentry = Arc::new(AtomicUsize::new(0));

        let buf = Arc::new(HostBuffer::new(32));
        let inner = {
            let off = Arc::downgrade(&off);
            let saw = saw_reentry.clone();
            callback(move |_| {
                if let Some(off) = off.upgrade() {
                    let again = Arc::new(HostBuffer::new(32));
                    if matches!(
                        off.sync_write(again.clone(), again.key()),
                        Err(OffloadError::DispatcherReentry)
                    ) {
                        saw.fetch_add(1, Ordering::SeqCst);
                    }
                    if matches!(off.synchronize(), Err(OffloadError::DispatcherReentry)) {
                        saw.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };
        off.async_write(buf.clone(), buf.key(), Some(inner)).unwrap();
        off.synchronize().unwrap();
        assert_eq!(saw_reentry.load(Ordering::SeqCst), 2);
    }

    /// Rejects the first `rejections` submissions with `RingFull`.
    struct FullDriver {
        rejections: u32,
        accepted: usize,
        flushes: usize,
    }

    impl IoDriver for FullDriver {
        fn submit(&mut self, _req: &IoRequest) -> Result<()> {
            if self.rejections > 0 {
                self.rejections -= 1;
                return Err(OffloadError::RingFull);
            }
            self.accepted += 1;
            Ok(())
        }

        fn flush(&mut self) -> Result<usize> {
            self.flushes += 1;
            Ok(0)
        }

        fn poll_completions(&mut self, _out: &mut Vec<offload_core::entry::IoCompletion>) -> usize {
            0
        }

        fn drain_all(&mut self, _out: &mut Vec<offload_core::entry::IoCompletion>) -> Result<()> {
            Ok(())
        }

        fn inflight(&self) -> usize {
            self.accepted
        }

        fn capacity(&self) -> usize {
            1
        }

        fn name(&self) -> &'static str {
            "full"
        }
    }

    fn dummy_request() -> IoRequest {
        IoRequest {
            slot: SlotId(0),
            op: IoOp::Write,
            fd: -1,
            offset: 0,
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    #[test]
    fn test_backoff_until_driver_has_room() {
        let driver = Mutex::new(FullDriver { rejections: 3, accepted: 0, flushes: 0 });
        let retries = AtomicU64::new(0);
        submit_with_backoff(&driver, &dummy_request(), 16, &retries).unwrap();

        let driver = driver.into_inner();
        assert_eq!(driver.accepted, 1);
        // One flush per rejection, one after the accepted submit.
        assert_eq!(driver.flushes, 4);
        assert_eq!(retries.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_saturated_driver_gives_up() {
        let driver = Mutex::new(FullDriver { rejections: u32::MAX, accepted: 0, flushes: 0 });
        let retries = AtomicU64::new(0);
        let err = submit_with_backoff(&driver, &dummy_request(), 2, &retries).unwrap_err();

        assert!(matches!(err, OffloadError::Io(IoFailure::Saturated(3))));
        assert_eq!(retries.load(Ordering::Relaxed), 2);
        assert_eq!(driver.lock().accepted, 0);
    }

    #[test]
    fn test_failed_backend_setup_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        // Beyond io_uring's SQ size limit, so ring setup fails everywhere.
        let err = Offloader::new(
            OffloadConfig::new(dir.path())
                .backend(BackendKind::Uring)
                .n_entries(1 << 17),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            OffloadError::Config(ConfigError::BackendSetup { backend: BackendKind::Uring, .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_write_drops_region_and_keeps_storage() {
        let dir = tempfile::tempdir().unwrap();
        let off = aio_offloader(dir.path(), 2);

        let kept = Arc::new(HostBuffer::new(256));
        off.sync_write(kept.clone(), kept.key()).unwrap();

        // Writes through a read-only descriptor fail with EBADF.
        let ro = File::open("/dev/null").unwrap();
        assert!(unsafe { libc::dup2(ro.as_raw_fd(), off.shared.fd()) } >= 0);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let buf = Arc::new(HostBuffer::from_bytes(vec![7u8; 1024]));
        {
            let calls = calls.clone();
            off.async_write(
                buf.clone(),
                buf.key(),
                Some(callback(move |c| calls.lock().push(c.failure()))),
            )
            .unwrap();
        }
        off.synchronize().unwrap();

        assert_eq!(*calls.lock(), vec![Some(IoFailure::Os(libc::EBADF))]);
        assert_eq!(off.region(buf.key()), None);
        assert_eq!(buf.to_vec().unwrap(), vec![7u8; 1024]);
        assert_eq!(off.region(kept.key()), Some(Region::new(0, 256)));

        let stats = off.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.writes_completed, 1);
        assert_eq!(stats.free_bytes, 1024);

        let again = Arc::new(HostBuffer::new(64));
        let err = off.sync_write(again.clone(), again.key()).unwrap_err();
        assert!(matches!(err, OffloadError::Io(IoFailure::Os(libc::EBADF))));
        assert_eq!(again.storage_len(), 64);
        assert_eq!(off.pending(), 0);
        assert_eq!(off.slots_in_use(), 0);
    }
}

//! `SlotPool` — the fixed pool of request slots.
//!
//! N slots are created up front and never resized. Free slot ids sit in a
//! lock-free queue; `acquire()` pops one or parks the caller on a condvar
//! until `release()` pushes one back. Any free slot is acceptable, there
//! is no FIFO fairness between waiters.
//!
//! Per-slot state is tracked so that a double release is reported instead
//! of corrupting the free list:
//!
//! ```text
//! Free → Reserved (acquire) → InFlight (submitted) → Completed → Free (release)
//! ```

use offload_core::entry::SlotId;
use offload_core::error::{OffloadError, Result};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Reserved = 1,
    InFlight = 2,
    Completed = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Free,
            1 => SlotState::Reserved,
            2 => SlotState::InFlight,
            _ => SlotState::Completed,
        }
    }
}

pub struct SlotPool {
    free: ArrayQueue<SlotId>,
    states: Box<[AtomicU8]>,
    in_use: AtomicUsize,
    high_water: AtomicUsize,
    /// Guards the two condvars; holds no data.
    lock: Mutex<()>,
    freed: Condvar,
    idle: Condvar,
}

impl SlotPool {
    /// Create a pool of `capacity` slots. `capacity` must be positive.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "slot pool capacity must be positive");
        assert!(capacity < u32::MAX as usize, "slot pool capacity too large");

        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            let _ = free.push(SlotId(i as u32));
        }
        let states = (0..capacity)
            .map(|_| AtomicU8::new(SlotState::Free as u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            free,
            states,
            in_use: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            lock: Mutex::new(()),
            freed: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Slots not in the `Free` state.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Largest `in_use()` ever observed.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        SlotState::from_u8(self.states[slot.as_usize()].load(Ordering::Acquire))
    }

    /// Take a free slot without blocking.
    pub fn try_acquire(&self) -> Option<SlotId> {
        let slot = self.free.pop()?;
        let prev = self.states[slot.as_usize()].swap(SlotState::Reserved as u8, Ordering::AcqRel);
        debug_assert_eq!(prev, SlotState::Free as u8, "free list held a busy slot");
        let now = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(now, Ordering::Relaxed);
        Some(slot)
    }

    /// Take a free slot, blocking the calling thread while the pool is exhausted.
    pub fn acquire(&self) -> SlotId {
        if let Some(slot) = self.try_acquire() {
            return slot;
        }
        let mut guard = self.lock.lock();
        loop {
            // Re-check under the lock: release() pushes before it notifies.
            if let Some(slot) = self.try_acquire() {
                return slot;
            }
            self.freed.wait(&mut guard);
        }
    }

    /// `Reserved → InFlight`. Returns false on any other starting state.
    pub fn mark_in_flight(&self, slot: SlotId) -> bool {
        self.transition(slot, SlotState::Reserved, SlotState::InFlight)
    }

    /// `InFlight → Completed`. Returns false on any other starting state.
    pub fn mark_completed(&self, slot: SlotId) -> bool {
        self.transition(slot, SlotState::InFlight, SlotState::Completed)
    }

    fn transition(&self, slot: SlotId, from: SlotState, to: SlotState) -> bool {
        self.states[slot.as_usize()]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Return a slot to the pool. Exactly once per acquire.
    pub fn release(&self, slot: SlotId) -> Result<()> {
        let Some(state) = self.states.get(slot.as_usize()) else {
            return Err(OffloadError::DoubleRelease(slot));
        };
        let prev = state.swap(SlotState::Free as u8, Ordering::AcqRel);
        if prev == SlotState::Free as u8 {
            return Err(OffloadError::DoubleRelease(slot));
        }

        let remaining = self.in_use.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.free.push(slot).is_err() {
            // More frees than slots: unreachable given the state check above.
            tracing::error!(%slot, "slot free list overflow");
        }

        let _guard = self.lock.lock();
        self.freed.notify_one();
        if remaining == 0 {
            self.idle.notify_all();
        }
        Ok(())
    }

    /// Block until every slot is free.
    pub fn wait_idle(&self) {
        let mut guard = self.lock.lock();
        while self.in_use() > 0 {
            self.idle.wait(&mut guard);
        }
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .field("high_water", &self.high_water())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_release_lifecycle() {
        let pool = SlotPool::new(2);
        let a = pool.acquire();
        assert_eq!(pool.state(a), SlotState::Reserved);
        assert!(pool.mark_in_flight(a));
        assert!(!pool.mark_in_flight(a));
        assert!(pool.mark_completed(a));
        assert_eq!(pool.state(a), SlotState::Completed);
        assert_eq!(pool.in_use(), 1);

        pool.release(a).unwrap();
        assert_eq!(pool.state(a), SlotState::Free);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_double_release_detected() {
        let pool = SlotPool::new(1);
        let s = pool.acquire();
        pool.release(s).unwrap();
        assert!(matches!(pool.release(s), Err(OffloadError::DoubleRelease(x)) if x == s));
        assert_eq!(pool.in_use(), 0);
        // Free list not corrupted: exactly one slot is available.
        assert!(pool.try_acquire().is_some());
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn test_release_out_of_range() {
        let pool = SlotPool::new(1);
        assert!(pool.release(SlotId(5)).is_err());
    }

    #[test]
    fn test_exhaustion_blocks_until_release() {
        let pool = Arc::new(SlotPool::new(2));
        let a = pool.acquire();
        let _b = pool.acquire();
        assert!(pool.try_acquire().is_none());

        let got = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pool = pool.clone();
            let got = got.clone();
            thread::spawn(move || {
                let s = pool.acquire();
                got.store(true, Ordering::SeqCst);
                s
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!got.load(Ordering::SeqCst), "third acquire must block");
        assert_eq!(pool.in_use(), 2);

        pool.release(a).unwrap();
        let c = waiter.join().unwrap();
        assert!(got.load(Ordering::SeqCst));
        assert_eq!(c, a);
        assert_eq!(pool.high_water(), 2);
    }

    #[test]
    fn test_never_exceeds_capacity_under_contention() {
        let pool = Arc::new(SlotPool::new(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let s = pool.acquire();
                        assert!(pool.in_use() <= 3);
                        pool.release(s).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
        assert!(pool.high_water() <= 3);
    }

    #[test]
    fn test_wait_idle() {
        let pool = Arc::new(SlotPool::new(4));
        let slots: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        let releaser = {
            let pool = pool.clone();
            thread::spawn(move || {
                for s in slots {
                    thread::sleep(Duration::from_millis(5));
                    pool.release(s).unwrap();
                }
            })
        };
        pool.wait_idle();
        assert_eq!(pool.in_use(), 0);
        releaser.join().unwrap();
    }
}

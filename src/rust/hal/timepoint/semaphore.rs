// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hal::timepoint::fence::TimePointFence,
    runtime::fail::Fail,
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Timeline value of a slot that is not in flight.
pub const UNUSED_VALUE: u64 = u64::MAX;

//======================================================================================================================
// Structures
//======================================================================================================================

struct SemaphorePoolInner {
    /// Timeline value of each slot.
    storage: Vec<AtomicU64>,
    /// Indices of free slots.
    free: Mutex<Vec<usize>>,
}

/// Fixed-capacity pool of timeline slots.
#[derive(Clone)]
pub struct TimePointSemaphorePool {
    inner: Arc<SemaphorePoolInner>,
}

/// One point on an emulated timeline: a target value plus the fences that signal it and that wait on it.
///
/// Owned by exactly one timeline at a time. It goes back to its pool through
/// [TimePointSemaphorePool::release_resolved] once the device confirmed the signal, or through
/// [TimePointSemaphorePool::release_unresolved] when abandoned. Dropping an unreleased timepoint takes the second path.
pub struct TimePointSemaphore {
    index: usize,
    value: u64,
    signal_fence: Option<TimePointFence>,
    wait_fence: Option<TimePointFence>,
    pool: Arc<SemaphorePoolInner>,
    released: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimePointSemaphorePool {
    pub fn new(capacity: usize) -> Result<Self, Fail> {
        if capacity == 0 {
            return Err(Fail::new(libc::EINVAL, "semaphore pool capacity must be greater than zero"));
        }
        Ok(Self {
            inner: Arc::new(SemaphorePoolInner {
                storage: (0..capacity).map(|_| AtomicU64::new(UNUSED_VALUE)).collect(),
                // Popped from the back, so slot 0 goes out first.
                free: Mutex::new((0..capacity).rev().collect()),
            }),
        })
    }

    /// Takes a slot for timeline value `value`. Fails with `EAGAIN` if every slot is in flight.
    pub fn acquire(&self, value: u64) -> Result<TimePointSemaphore, Fail> {
        let index: Option<usize> = self.inner.free.lock().pop();
        let Some(index) = index else {
            let cause: String = format!("all {} timepoint semaphores are in flight", self.capacity());
            warn!("acquire(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, &cause));
        };
        self.inner.storage[index].store(value, Ordering::Release);
        Ok(TimePointSemaphore {
            index,
            value,
            signal_fence: None,
            wait_fence: None,
            pool: self.inner.clone(),
            released: false,
        })
    }

    /// Returns timepoints whose signal the device confirmed. Their fences must already be detached; otherwise the whole
    /// batch is rejected with `EINVAL` and left untouched. On success `timepoints` is left empty.
    pub fn release_resolved(&self, timepoints: &mut Vec<TimePointSemaphore>) -> Result<(), Fail> {
        for timepoint in timepoints.iter() {
            if !Arc::ptr_eq(&timepoint.pool, &self.inner) {
                let cause: String = format!("timepoint {} belongs to another pool", timepoint.index);
                error!("release_resolved(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            if timepoint.signal_fence.is_some() || timepoint.wait_fence.is_some() {
                let cause: String = format!(
                    "timepoint {} (value {}) still has a fence attached",
                    timepoint.index, timepoint.value
                );
                error!("release_resolved(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
        }
        self.merge(timepoints);
        Ok(())
    }

    /// Returns abandoned timepoints, detaching any fence still attached. On success `timepoints` is left empty.
    pub fn release_unresolved(&self, timepoints: &mut Vec<TimePointSemaphore>) -> Result<(), Fail> {
        for timepoint in timepoints.iter() {
            if !Arc::ptr_eq(&timepoint.pool, &self.inner) {
                let cause: String = format!("timepoint {} belongs to another pool", timepoint.index);
                error!("release_unresolved(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
        }
        for timepoint in timepoints.iter_mut() {
            timepoint.signal_fence = None;
            timepoint.wait_fence = None;
        }
        self.merge(timepoints);
        Ok(())
    }

    /// Resets every slot of the batch outside the lock, then puts them all back on the free list at once.
    fn merge(&self, timepoints: &mut Vec<TimePointSemaphore>) {
        if timepoints.is_empty() {
            return;
        }
        let mut indices: Vec<usize> = Vec::with_capacity(timepoints.len());
        for mut timepoint in timepoints.drain(..) {
            self.inner.storage[timepoint.index].store(UNUSED_VALUE, Ordering::Release);
            timepoint.released = true;
            indices.push(timepoint.index);
        }
        self.inner.free.lock().extend(indices);
    }

    pub fn capacity(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// Timeline value currently stored in slot `index`.
    pub fn slot_value(&self, index: usize) -> Option<u64> {
        self.inner
            .storage
            .get(index)
            .map(|value| value.load(Ordering::Acquire))
    }
}

impl TimePointSemaphore {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn signal_fence(&self) -> Option<&TimePointFence> {
        self.signal_fence.as_ref()
    }

    pub fn wait_fence(&self) -> Option<&TimePointFence> {
        self.wait_fence.as_ref()
    }

    pub fn set_signal_fence(&mut self, fence: TimePointFence) {
        self.signal_fence = Some(fence);
    }

    pub fn set_wait_fence(&mut self, fence: TimePointFence) {
        self.wait_fence = Some(fence);
    }

    pub fn take_signal_fence(&mut self) -> Option<TimePointFence> {
        self.signal_fence.take()
    }

    pub fn take_wait_fence(&mut self) -> Option<TimePointFence> {
        self.wait_fence.take()
    }

    /// Detaches both fences once the device confirmed the signal.
    pub fn detach_fences(&mut self) {
        self.signal_fence = None;
        self.wait_fence = None;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for TimePointSemaphore {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        trace!("drop(): abandoning timepoint {} (value {})", self.index, self.value);
        self.signal_fence = None;
        self.wait_fence = None;
        self.pool.storage[self.index].store(UNUSED_VALUE, Ordering::Release);
        let mut free: MutexGuard<Vec<usize>> = self.pool.free.lock();
        free.push(self.index);
    }
}

impl fmt::Debug for TimePointSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePointSemaphore")
            .field("index", &self.index)
            .field("value", &self.value)
            .field("signal_fence", &self.signal_fence)
            .field("wait_fence", &self.wait_fence)
            .finish()
    }
}

impl fmt::Debug for TimePointSemaphorePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePointSemaphorePool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TimePointSemaphore,
        TimePointSemaphorePool,
        UNUSED_VALUE,
    };
    use crate::hal::{
        backend::HostBackend,
        timepoint::fence::TimePointFencePool,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn capacity_is_conserved() -> Result<()> {
        const CAPACITY: usize = 3;
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(CAPACITY)?;
        let mut held: Vec<TimePointSemaphore> = Vec::new();
        for value in 1..=CAPACITY as u64 {
            held.push(pool.acquire(value)?);
            crate::ensure_eq!(pool.free_count() + pool.in_flight_count(), CAPACITY);
        }
        match pool.acquire(10) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EAGAIN),
            Ok(_) => anyhow::bail!("acquire beyond capacity should fail"),
        }

        pool.release_resolved(&mut held)?;
        crate::ensure_eq!(held.is_empty(), true);
        crate::ensure_eq!(pool.free_count(), CAPACITY);
        Ok(())
    }

    #[test]
    fn acquire_sets_value() -> Result<()> {
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(2)?;
        let timepoint: TimePointSemaphore = pool.acquire(42)?;
        crate::ensure_eq!(timepoint.value(), 42);
        crate::ensure_eq!(pool.slot_value(timepoint.index()), Some(42));
        Ok(())
    }

    #[test]
    fn abandoned_timepoint_is_reclaimed() -> Result<()> {
        let fences: TimePointFencePool = TimePointFencePool::new(Arc::new(HostBackend::new()), 1)?;
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(1)?;

        let mut timepoint: TimePointSemaphore = pool.acquire(7)?;
        let index: usize = timepoint.index();
        timepoint.set_wait_fence(fences.acquire()?);
        let mut batch: Vec<TimePointSemaphore> = vec![timepoint];

        // The device never confirmed the signal, so the resolved path refuses the batch and leaves it alone.
        match pool.release_resolved(&mut batch) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("release_resolved should reject an attached fence"),
        }
        crate::ensure_eq!(batch.len(), 1);
        crate::ensure_eq!(pool.free_count(), 0);
        crate::ensure_eq!(pool.slot_value(index), Some(7));

        pool.release_unresolved(&mut batch)?;
        crate::ensure_eq!(batch.is_empty(), true);
        crate::ensure_eq!(pool.free_count(), 1);
        crate::ensure_eq!(pool.slot_value(index), Some(UNUSED_VALUE));
        // The detached fence went back to its own pool.
        crate::ensure_eq!(fences.free_count(), 1);
        Ok(())
    }

    #[test]
    fn resolved_release_after_detaching() -> Result<()> {
        let fences: TimePointFencePool = TimePointFencePool::new(Arc::new(HostBackend::new()), 1)?;
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(1)?;
        let mut timepoint: TimePointSemaphore = pool.acquire(3)?;
        timepoint.set_signal_fence(fences.acquire()?);
        timepoint.detach_fences();
        pool.release_resolved(&mut vec![timepoint])?;
        crate::ensure_eq!(pool.free_count(), 1);
        crate::ensure_eq!(fences.free_count(), 1);
        Ok(())
    }

    #[test]
    fn dropping_unreleased_timepoint_returns_slot() -> Result<()> {
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(1)?;
        let timepoint: TimePointSemaphore = pool.acquire(1)?;
        crate::ensure_eq!(pool.free_count(), 0);
        drop(timepoint);
        crate::ensure_eq!(pool.free_count(), 1);
        crate::ensure_eq!(pool.slot_value(0), Some(UNUSED_VALUE));
        Ok(())
    }

    #[test]
    fn rejects_foreign_timepoints() -> Result<()> {
        let pool: TimePointSemaphorePool = TimePointSemaphorePool::new(1)?;
        let other: TimePointSemaphorePool = TimePointSemaphorePool::new(1)?;
        let mut batch: Vec<TimePointSemaphore> = vec![other.acquire(1)?];
        match pool.release_unresolved(&mut batch) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(()) => anyhow::bail!("foreign timepoint should be rejected"),
        }
        other.release_unresolved(&mut batch)?;
        crate::ensure_eq!(other.free_count(), 1);
        Ok(())
    }
}

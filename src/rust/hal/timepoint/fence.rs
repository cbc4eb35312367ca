// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hal::backend::{
        DeviceBackend,
        FenceHandle,
        FenceStatus,
    },
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
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct FreeList {
    fences: Vec<FenceHandle>,
    in_flight: usize,
}

struct FencePoolInner {
    backend: Arc<dyn DeviceBackend>,
    capacity: usize,
    free: Mutex<FreeList>,
}

/// Shared handle on a pooled fence. The fence goes back to its pool once the last holder drops it.
#[derive(Clone)]
pub struct TimePointFence {
    inner: Arc<FenceToken>,
}

/// Fixed-capacity pool of binary device fences, one per in-flight submission.
///
/// Exhaustion is reported to the caller instead of growing the pool, which bounds the number of submissions in flight.
#[derive(Clone)]
pub struct TimePointFencePool {
    inner: Arc<FencePoolInner>,
}

/// Exclusive ownership of one pooled fence. Dropping it is the only way back to the free list.
struct FenceToken {
    handle: FenceHandle,
    /// Cached once observed. Device fences are single-shot, so a signaled fence is never queried again.
    signaled: AtomicBool,
    pool: Arc<FencePoolInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimePointFencePool {
    /// Creates every fence of the pool up front.
    pub fn new(backend: Arc<dyn DeviceBackend>, capacity: usize) -> Result<Self, Fail> {
        if capacity == 0 {
            return Err(Fail::new(libc::EINVAL, "fence pool capacity must be greater than zero"));
        }
        let mut fences: Vec<FenceHandle> = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match backend.create_fence() {
                Ok(fence) => fences.push(fence),
                Err(e) => {
                    error!("new(): failed to create fence: {:?}", e);
                    for fence in fences {
                        backend.destroy_fence(fence);
                    }
                    return Err(e);
                },
            }
        }
        Ok(Self {
            inner: Arc::new(FencePoolInner {
                backend,
                capacity,
                free: Mutex::new(FreeList { fences, in_flight: 0 }),
            }),
        })
    }

    /// Takes a fence out of the pool. Fails with `EAGAIN` if every fence is in flight.
    pub fn acquire(&self) -> Result<TimePointFence, Fail> {
        let handle: FenceHandle = {
            let mut free: MutexGuard<FreeList> = self.inner.free.lock();
            match free.fences.pop() {
                Some(handle) => {
                    free.in_flight += 1;
                    handle
                },
                None => {
                    let cause: String = format!("all {} timepoint fences are in flight", self.inner.capacity);
                    warn!("acquire(): {}", cause);
                    return Err(Fail::new(libc::EAGAIN, &cause));
                },
            }
        };
        Ok(TimePointFence {
            inner: Arc::new(FenceToken {
                handle,
                signaled: AtomicBool::new(false),
                pool: self.inner.clone(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.lock().fences.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.free.lock().in_flight
    }

    /// Free and in-flight counts observed atomically.
    pub fn counts(&self) -> (usize, usize) {
        let free: MutexGuard<FreeList> = self.inner.free.lock();
        (free.fences.len(), free.in_flight)
    }
}

impl TimePointFence {
    pub fn handle(&self) -> FenceHandle {
        self.inner.handle
    }

    /// Status of the fence. The device is queried until the fence is seen signaled, and never after that.
    pub fn get_status(&self) -> Result<FenceStatus, Fail> {
        if self.inner.signaled.load(Ordering::Acquire) {
            return Ok(FenceStatus::Signaled);
        }
        let status: FenceStatus = self.inner.pool.backend.get_fence_status(self.inner.handle)?;
        if status == FenceStatus::Signaled {
            self.inner.signaled.store(true, Ordering::Release);
        }
        Ok(status)
    }

    /// Re-arms the fence for reuse, whoever else holds it.
    pub fn reset_status(&self) -> Result<(), Fail> {
        self.inner.pool.backend.reset_fence(self.inner.handle)?;
        self.inner.signaled.store(false, Ordering::Release);
        Ok(())
    }

    /// Signals the fence on completion of the work it guards.
    pub fn signal(&self) -> Result<(), Fail> {
        self.inner.pool.backend.signal_fence(self.inner.handle)
    }

    /// Number of holders of this fence.
    pub fn holder_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Checks whether both values refer to the same pooled fence.
    pub fn ptr_eq(&self, other: &TimePointFence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for FenceToken {
    fn drop(&mut self) {
        // The device call happens before taking the pool lock.
        if let Err(e) = self.pool.backend.reset_fence(self.handle) {
            warn!("drop(): failed to reset fence {:?}: {:?}", self.handle, e);
        }
        let mut free: MutexGuard<FreeList> = self.pool.free.lock();
        free.in_flight -= 1;
        free.fences.push(self.handle);
    }
}

impl Drop for FencePoolInner {
    fn drop(&mut self) {
        let free: &mut FreeList = self.free.get_mut();
        debug_assert_eq!(free.in_flight, 0);
        debug_assert_eq!(free.fences.len(), self.capacity);
        for fence in free.fences.drain(..) {
            self.backend.destroy_fence(fence);
        }
    }
}

impl fmt::Debug for TimePointFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePointFence")
            .field("handle", &self.inner.handle)
            .field("signaled", &self.inner.signaled.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for TimePointFencePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (free, in_flight): (usize, usize) = self.counts();
        f.debug_struct("TimePointFencePool")
            .field("capacity", &self.inner.capacity)
            .field("free", &free)
            .field("in_flight", &in_flight)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

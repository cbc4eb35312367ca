// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::slab::Slab;
use ::std::{
    fmt,
    sync::atomic::{
        AtomicBool,
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Opaque handle of a binary device fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceHandle(usize);

/// Observable state of a binary device fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    NotReady,
    Signaled,
}

/// Device backend that runs queue work on the host and keeps fences in a table.
pub struct HostBackend {
    fences: Mutex<Slab<FenceStatus>>,
    /// Once set, every fence operation reports a lost device.
    lost: AtomicBool,
    /// Number of fence status queries served.
    queries: AtomicUsize,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Device objects the timepoint machinery is built on.
///
/// Calls may block on the device, so callers never hold a pool lock across them.
pub trait DeviceBackend: Send + Sync {
    /// Creates an unsignaled fence.
    fn create_fence(&self) -> Result<FenceHandle, Fail>;

    /// Destroys a fence. Unknown handles are ignored.
    fn destroy_fence(&self, fence: FenceHandle);

    /// Queries the device for the status of a fence.
    fn get_fence_status(&self, fence: FenceHandle) -> Result<FenceStatus, Fail>;

    /// Returns a fence to the unsignaled state.
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), Fail>;

    /// Signals a fence on completion of the queue work it guards.
    fn signal_fence(&self, fence: FenceHandle) -> Result<(), Fail>;
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl HostBackend {
    pub fn new() -> Self {
        Self {
            fences: Mutex::new(Slab::new()),
            lost: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    /// Simulates an unrecoverable device failure.
    pub fn lose_device(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!("lose_device(): host device lost");
        }
    }

    /// Number of fence status queries served so far.
    pub fn fence_query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Number of live fences.
    pub fn fence_count(&self) -> usize {
        self.fences.lock().len()
    }

    fn check_device(&self) -> Result<(), Fail> {
        if self.lost.load(Ordering::Acquire) {
            return Err(Fail::new(libc::ENODEV, "host device lost"));
        }
        Ok(())
    }

    fn with_fence<T, F>(&self, fence: FenceHandle, f: F) -> Result<T, Fail>
    where
        F: FnOnce(&mut FenceStatus) -> T,
    {
        self.check_device()?;
        let mut fences: MutexGuard<Slab<FenceStatus>> = self.fences.lock();
        match fences.get_mut(fence.into()) {
            Some(status) => Ok(f(status)),
            None => {
                let cause: String = format!("unknown fence {:?}", fence);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl DeviceBackend for HostBackend {
    fn create_fence(&self) -> Result<FenceHandle, Fail> {
        self.check_device()?;
        let ix: usize = self.fences.lock().insert(FenceStatus::NotReady);
        Ok(FenceHandle::from(ix))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut fences: MutexGuard<Slab<FenceStatus>> = self.fences.lock();
        if fences.contains(fence.into()) {
            fences.remove(fence.into());
        }
    }

    fn get_fence_status(&self, fence: FenceHandle) -> Result<FenceStatus, Fail> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.with_fence(fence, |status| *status)
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), Fail> {
        self.with_fence(fence, |status| *status = FenceStatus::NotReady)
    }

    fn signal_fence(&self, fence: FenceHandle) -> Result<(), Fail> {
        self.with_fence(fence, |status| *status = FenceStatus::Signaled)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("fences", &self.fence_count())
            .field("lost", &self.lost.load(Ordering::Relaxed))
            .finish()
    }
}

impl From<usize> for FenceHandle {
    fn from(ix: usize) -> Self {
        Self(ix)
    }
}

impl From<FenceHandle> for usize {
    fn from(val: FenceHandle) -> Self {
        val.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

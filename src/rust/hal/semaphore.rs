// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hal::{
        backend::FenceStatus,
        timepoint::{
            TimePointFence,
            TimePointSemaphore,
            TimePointSemaphorePool,
        },
    },
    runtime::{
        fail::Fail,
        time::Deadline,
    },
    task::WaitSource,
};
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::std::{
    fmt,
    mem,
    sync::Arc,
    thread,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How often a blocked waiter re-checks device fences, which signal without notifying anyone.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Whether a multi-wait needs one or all of its semaphores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    Any,
    All,
}

struct TimelineState {
    current: u64,
    /// Set once the semaphore failed. Every later operation reports it.
    failure: Option<Fail>,
    /// Device signals not observed yet, sorted by value. A signal already observed stays here until the submission
    /// waiting on it signals its own fence.
    pending: Vec<TimePointSemaphore>,
}

struct TimelineInner {
    pool: TimePointSemaphorePool,
    state: Mutex<TimelineState>,
    changed: Condvar,
}

/// Semaphore with a monotonically increasing 64-bit payload, emulated with binary fences.
///
/// Every pending device signal is a timepoint taken from the pool and tied to the fence of the submission that will
/// signal it. Querying the semaphore advances the payload over the timepoints whose fence is signaled and returns them
/// to the pool once their waiter, if any, is done with them.
#[derive(Clone)]
pub struct TimelineSemaphore {
    inner: Arc<TimelineInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimelineSemaphore {
    pub fn new(initial_value: u64, pool: TimePointSemaphorePool) -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                pool,
                state: Mutex::new(TimelineState {
                    current: initial_value,
                    failure: None,
                    pending: Vec::new(),
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Current payload. Fails with the failure status once the semaphore failed.
    pub fn query(&self) -> Result<u64, Fail> {
        let (candidates, waiters): (Vec<(u64, TimePointFence)>, Vec<TimePointFence>) = {
            let state: MutexGuard<TimelineState> = self.inner.state.lock();
            if let Some(e) = &state.failure {
                return Err(e.clone());
            }
            if state.pending.is_empty() {
                return Ok(state.current);
            }
            let candidates: Vec<(u64, TimePointFence)> = state
                .pending
                .iter()
                .filter(|timepoint| timepoint.value() > state.current)
                .filter_map(|timepoint| timepoint.signal_fence().map(|fence| (timepoint.value(), fence.clone())))
                .collect();
            let waiters: Vec<TimePointFence> = state
                .pending
                .iter()
                .filter_map(|timepoint| timepoint.wait_fence().cloned())
                .collect();
            (candidates, waiters)
        };

        // Fence queries may block on the device, so they run without the lock.
        let mut reached: Option<u64> = None;
        for (value, fence) in &candidates {
            match fence.get_status() {
                Ok(FenceStatus::Signaled) => reached = Some(reached.map_or(*value, |r| r.max(*value))),
                Ok(FenceStatus::NotReady) => {},
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                },
            }
        }
        drop(candidates);
        let mut settled: Vec<TimePointFence> = Vec::with_capacity(waiters.len());
        for fence in waiters {
            match fence.get_status() {
                Ok(FenceStatus::Signaled) => settled.push(fence),
                Ok(FenceStatus::NotReady) => {},
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                },
            }
        }

        let (current, resolved): (u64, Vec<TimePointSemaphore>) = {
            let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
            if let Some(e) = &state.failure {
                return Err(e.clone());
            }
            match reached {
                Some(value) if value > state.current => {
                    state.current = value;
                    self.inner.changed.notify_all();
                },
                _ => {},
            }
            (state.current, Self::take_resolved(&mut state, &settled))
        };
        drop(settled);
        self.release_resolved(resolved);
        Ok(current)
    }

    /// Signals `value` from the host. The value must be greater than the current payload.
    pub fn signal(&self, value: u64) -> Result<(), Fail> {
        let resolved: Vec<TimePointSemaphore> = {
            let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
            if let Some(e) = &state.failure {
                return Err(e.clone());
            }
            if value <= state.current {
                let cause: String = format!("signal value {} does not exceed current value {}", value, state.current);
                error!("signal(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            state.current = value;
            self.inner.changed.notify_all();
            Self::take_resolved(&mut state, &[])
        };
        self.release_resolved(resolved);
        Ok(())
    }

    /// Puts the semaphore in a failed state. Pending timepoints are abandoned and waiters observe `status`.
    pub fn fail(&self, status: Fail) {
        let mut abandoned: Vec<TimePointSemaphore> = {
            let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
            if state.failure.is_some() {
                return;
            }
            if status.is_device_lost() {
                error!("fail(): semaphore lost with its device: {:?}", status);
            } else {
                warn!("fail(): {:?}", status);
            }
            state.failure = Some(status);
            self.inner.changed.notify_all();
            mem::take(&mut state.pending)
        };
        if let Err(e) = self.inner.pool.release_unresolved(&mut abandoned) {
            error!("fail(): failed to release timepoints: {:?}", e);
        }
    }

    /// Failure status, if the semaphore failed.
    pub fn failure(&self) -> Option<Fail> {
        self.inner.state.lock().failure.clone()
    }

    /// Blocks until the payload reaches `value`. Fails with `ETIMEDOUT` once `deadline` expires, or with the failure
    /// status of the semaphore.
    pub fn wait(&self, value: u64, deadline: Deadline) -> Result<(), Fail> {
        loop {
            if self.query()? >= value {
                return Ok(());
            }
            if deadline.has_expired() {
                let cause: String = format!("semaphore did not reach {} before the deadline", value);
                return Err(Fail::new(libc::ETIMEDOUT, &cause));
            }
            let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
            if state.failure.is_some() || state.current >= value {
                continue;
            }
            self.inner
                .changed
                .wait_for(&mut state, deadline.next_wakeup(POLL_INTERVAL));
        }
    }

    /// Checks that a device signal of `value` can be scheduled: it must be past the current payload and past every
    /// pending signal.
    pub fn validate_signal(&self, value: u64) -> Result<(), Fail> {
        let state: MutexGuard<TimelineState> = self.inner.state.lock();
        if let Some(e) = &state.failure {
            return Err(e.clone());
        }
        let last: u64 = state.pending.last().map_or(state.current, |timepoint| timepoint.value());
        if value <= state.current || value <= last {
            let cause: String = format!("signal value {} does not exceed pending value {}", value, last);
            error!("validate_signal(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    /// Registers a pending device signal. The timepoint must carry the fence of the submission that signals it.
    ///
    /// The value is checked again under the lock, since another submission may have scheduled a signal after
    /// [TimelineSemaphore::validate_signal] ran. A rejected timepoint goes back to the pool.
    pub fn enqueue_signal(&self, timepoint: TimePointSemaphore) -> Result<(), Fail> {
        debug_assert!(timepoint.signal_fence().is_some());
        let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
        let rejection: Option<Fail> = match &state.failure {
            Some(e) => Some(e.clone()),
            None => {
                let last: u64 = state.pending.last().map_or(state.current, |pending| pending.value());
                if timepoint.value() <= state.current || timepoint.value() <= last {
                    let cause: String = format!(
                        "signal value {} does not exceed pending value {}",
                        timepoint.value(),
                        last.max(state.current)
                    );
                    error!("enqueue_signal(): {}", cause);
                    Some(Fail::new(libc::EINVAL, &cause))
                } else {
                    None
                }
            },
        };
        if let Some(e) = rejection {
            drop(state);
            self.inner.pool.release_unresolved(&mut vec![timepoint])?;
            return Err(e);
        }
        state.pending.push(timepoint);
        Ok(())
    }

    /// Ties a wait for `value` to the first pending signal that satisfies it. `fence` is the fence of the waiting
    /// submission; the timepoint stays in flight until that fence is signaled.
    ///
    /// Returns false if the payload already reached `value`, if no pending signal satisfies it yet, or if another
    /// submission already waits on that signal.
    pub fn attach_wait_fence(&self, value: u64, fence: &TimePointFence) -> Result<bool, Fail> {
        let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
        if let Some(e) = &state.failure {
            return Err(e.clone());
        }
        if state.current >= value {
            return Ok(false);
        }
        let Some(timepoint) = state
            .pending
            .iter_mut()
            .find(|timepoint| timepoint.value() >= value && timepoint.signal_fence().is_some())
        else {
            return Ok(false);
        };
        if timepoint.wait_fence().is_some() {
            return Ok(false);
        }
        timepoint.set_wait_fence(fence.clone());
        Ok(true)
    }

    /// Drops every reference to `fence`, the fence of a submission that will never run. Signals it scheduled are
    /// withdrawn and waits it attached are released.
    pub fn abandon_fence(&self, fence: &TimePointFence) {
        let (mut withdrawn, resolved): (Vec<TimePointSemaphore>, Vec<TimePointSemaphore>) = {
            let mut state: MutexGuard<TimelineState> = self.inner.state.lock();
            let mut withdrawn: Vec<TimePointSemaphore> = Vec::new();
            for mut timepoint in mem::take(&mut state.pending) {
                if timepoint.signal_fence().map_or(false, |signal| signal.ptr_eq(fence)) {
                    withdrawn.push(timepoint);
                    continue;
                }
                if timepoint.wait_fence().map_or(false, |wait| wait.ptr_eq(fence)) {
                    drop(timepoint.take_wait_fence());
                }
                state.pending.push(timepoint);
            }
            (withdrawn, Self::take_resolved(&mut state, &[]))
        };
        if !withdrawn.is_empty() {
            debug!("abandon_fence(): withdrawing {} pending signals", withdrawn.len());
            if let Err(e) = self.inner.pool.release_unresolved(&mut withdrawn) {
                error!("abandon_fence(): failed to release timepoints: {:?}", e);
            }
        }
        self.release_resolved(resolved);
    }

    /// Checks whether both handles refer to the same semaphore.
    pub fn ptr_eq(&self, other: &TimelineSemaphore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of device signals not observed yet.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Removes the timepoints the payload reached, except those whose wait fence is not in `settled` yet.
    fn take_resolved(state: &mut TimelineState, settled: &[TimePointFence]) -> Vec<TimePointSemaphore> {
        let current: u64 = state.current;
        let split: usize = state.pending.partition_point(|timepoint| timepoint.value() <= current);
        if split == 0 {
            return Vec::new();
        }
        let unreached: Vec<TimePointSemaphore> = state.pending.split_off(split);
        let mut resolved: Vec<TimePointSemaphore> = Vec::with_capacity(split);
        for timepoint in mem::replace(&mut state.pending, unreached) {
            let released: bool = match timepoint.wait_fence() {
                Some(wait) => settled.iter().any(|fence| fence.ptr_eq(wait)),
                None => true,
            };
            if released {
                resolved.push(timepoint);
            } else {
                state.pending.push(timepoint);
            }
        }
        // Held timepoints sort before every unreached one.
        state.pending.rotate_right(split - resolved.len());
        resolved
    }

    fn release_resolved(&self, mut resolved: Vec<TimePointSemaphore>) {
        if resolved.is_empty() {
            return;
        }
        for timepoint in resolved.iter_mut() {
            timepoint.detach_fences();
        }
        if let Err(e) = self.inner.pool.release_resolved(&mut resolved) {
            error!("release_resolved(): {:?}", e);
        }
    }
}

/// Blocks until one or all of `semaphores` reach their value in `values`.
pub fn wait_semaphores(
    mode: WaitMode,
    semaphores: &[TimelineSemaphore],
    values: &[u64],
    deadline: Deadline,
) -> Result<(), Fail> {
    if semaphores.len() != values.len() {
        let cause: String = format!("{} semaphores but {} values", semaphores.len(), values.len());
        error!("wait_semaphores(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    if semaphores.is_empty() {
        return Ok(());
    }

    loop {
        let mut reached: usize = 0;
        for (semaphore, value) in semaphores.iter().zip(values) {
            if semaphore.query()? >= *value {
                if mode == WaitMode::Any {
                    return Ok(());
                }
                reached += 1;
            }
        }
        if reached == semaphores.len() {
            return Ok(());
        }
        if deadline.has_expired() {
            let cause: String = format!("{} of {} semaphores reached their value", reached, semaphores.len());
            return Err(Fail::new(libc::ETIMEDOUT, &cause));
        }
        thread::sleep(deadline.next_wakeup(POLL_INTERVAL));
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl WaitSource for TimelineSemaphore {
    fn is_reached(&self, value: u64) -> Result<bool, Fail> {
        Ok(self.query()? >= value)
    }
}

impl fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state: MutexGuard<TimelineState> = self.inner.state.lock();
        f.debug_struct("TimelineSemaphore")
            .field("current", &state.current)
            .field("failure", &state.failure)
            .field("pending", &state.pending.len())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

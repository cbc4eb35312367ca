// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    time::Deadline,
};
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Longest single sleep of a waiter, so that cancellation and deadlines are re-checked.
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Invoked exactly once with the final status of a graph.
pub type CompletionFn = Box<dyn FnOnce(Result<(), Fail>) + Send>;

/// How a task left the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Aborted,
}

struct ScopeState {
    /// First error reported by any task.
    first_error: Option<Fail>,
    /// Set once every task of the graph has retired and the completion callback returned.
    done: bool,
    /// Set when the last task retired.
    finishing: bool,
    on_complete: Option<CompletionFn>,
}

/// Result sink shared by all tasks of one submitted graph.
pub struct Scope {
    name: String,
    /// Tasks that have not retired yet.
    pending: AtomicUsize,
    cancelled: AtomicBool,
    completed: AtomicUsize,
    failed: AtomicUsize,
    aborted: AtomicUsize,
    state: Mutex<ScopeState>,
    idle: Condvar,
}

/// Counters of a graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeCounters {
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub pending: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scope {
    pub fn new(name: String, on_complete: Option<CompletionFn>) -> Arc<Self> {
        Arc::new(Self {
            name,
            pending: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            state: Mutex::new(ScopeState {
                first_error: None,
                done: false,
                finishing: false,
                on_complete,
            }),
            idle: Condvar::new(),
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Accounts for `count` more tasks that will retire into this scope.
    pub(crate) fn add_pending(&self, count: usize) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    /// Records a task error. Only the first one is kept.
    pub(crate) fn fail(&self, error: Fail) {
        let mut state: MutexGuard<ScopeState> = self.state.lock();
        if state.first_error.is_none() {
            state.first_error = Some(error);
        }
    }

    /// Requests that tasks of this scope that have not started yet are skipped.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("cancel(): graph={}", self.name);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Retires one task. Returns true if it was the last one of the graph.
    pub(crate) fn retire(&self, outcome: TaskOutcome) -> bool {
        match outcome {
            TaskOutcome::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Aborted => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
        let previous: usize = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "graph {} retired more tasks than it holds", self.name);
        if previous != 1 {
            return false;
        }
        self.finish();
        true
    }

    /// Runs the completion callback outside of the lock, then marks the graph done and wakes waiters.
    pub(crate) fn finish(&self) {
        let (result, callback): (Result<(), Fail>, Option<CompletionFn>) = {
            let mut state: MutexGuard<ScopeState> = self.state.lock();
            if state.done || state.finishing {
                return;
            }
            state.finishing = true;
            (self.result_locked(&state), state.on_complete.take())
        };
        match &result {
            Ok(()) => trace!("finish(): graph={} completed", self.name),
            Err(e) => debug!("finish(): graph={} error={:?}", self.name, e),
        }
        if let Some(callback) = callback {
            callback(result);
        }
        let mut state: MutexGuard<ScopeState> = self.state.lock();
        state.done = true;
        self.idle.notify_all();
    }

    fn result_locked(&self, state: &ScopeState) -> Result<(), Fail> {
        if let Some(e) = &state.first_error {
            return Err(e.clone());
        }
        if self.is_cancelled() {
            let cause: String = format!("graph {} was cancelled", self.name);
            return Err(Fail::new(libc::ECANCELED, &cause));
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().done
    }

    /// Final status of the graph, or `None` while tasks are still outstanding.
    pub fn status(&self) -> Option<Result<(), Fail>> {
        let state: MutexGuard<ScopeState> = self.state.lock();
        if state.done {
            Some(self.result_locked(&state))
        } else {
            None
        }
    }

    /// Blocks until every task of the graph has retired or `deadline` expires.
    pub fn wait(&self, deadline: Deadline) -> Result<(), Fail> {
        let mut state: MutexGuard<ScopeState> = self.state.lock();
        loop {
            if state.done {
                return self.result_locked(&state);
            }
            if deadline.has_expired() {
                let cause: String = format!("graph {} did not complete before the deadline", self.name);
                return Err(Fail::new(libc::ETIMEDOUT, &cause));
            }
            self.idle.wait_for(&mut state, deadline.next_wakeup(WAIT_INTERVAL));
        }
    }

    pub fn counters(&self) -> ScopeCounters {
        ScopeCounters {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Acquire),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("counters", &self.counters())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Scope,
        ScopeCounters,
        TaskOutcome,
    };
    use crate::runtime::{
        fail::Fail,
        time::Deadline,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    #[test]
    fn keeps_first_error() -> Result<()> {
        let scope: Arc<Scope> = Scope::new("errors".to_string(), None);
        scope.add_pending(3);
        scope.fail(Fail::new(libc::EIO, "first"));
        crate::ensure_eq!(scope.retire(TaskOutcome::Failed), false);
        scope.fail(Fail::new(libc::EINVAL, "second"));
        crate::ensure_eq!(scope.retire(TaskOutcome::Failed), false);
        crate::ensure_eq!(scope.status().is_none(), true);
        crate::ensure_eq!(scope.retire(TaskOutcome::Aborted), true);

        match scope.wait(Deadline::Immediate) {
            Err(e) => crate::ensure_eq!(e.errno, libc::EIO),
            Ok(()) => anyhow::bail!("graph with a failed task should report an error"),
        }
        crate::ensure_eq!(
            scope.counters(),
            ScopeCounters {
                completed: 0,
                failed: 2,
                aborted: 1,
                pending: 0
            }
        );
        Ok(())
    }

    #[test]
    fn callback_runs_once() -> Result<()> {
        let calls: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let calls_clone: Arc<AtomicUsize> = calls.clone();
        let scope: Arc<Scope> = Scope::new(
            "callback".to_string(),
            Some(Box::new(move |result| {
                if result.is_ok() {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );
        scope.add_pending(1);
        crate::ensure_eq!(scope.retire(TaskOutcome::Completed), true);
        scope.finish();
        crate::ensure_eq!(calls.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(scope.is_complete(), true);
        Ok(())
    }

    #[test]
    fn cancelled_graph_reports_cancellation() -> Result<()> {
        let scope: Arc<Scope> = Scope::new("cancel".to_string(), None);
        scope.add_pending(1);
        scope.cancel();
        scope.retire(TaskOutcome::Aborted);
        match scope.status() {
            Some(Err(e)) => crate::ensure_eq!(e.is_cancelled(), true),
            other => anyhow::bail!("unexpected status {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn wait_times_out() -> Result<()> {
        let scope: Arc<Scope> = Scope::new("stuck".to_string(), None);
        scope.add_pending(1);
        match scope.wait(Deadline::from_timeout(::std::time::Duration::from_millis(5))) {
            Err(e) => crate::ensure_eq!(e.is_deadline_exceeded(), true),
            Ok(()) => anyhow::bail!("wait should time out"),
        }
        Ok(())
    }
}

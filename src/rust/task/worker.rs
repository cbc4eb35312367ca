// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::collections::AtomicSlist,
    task::{
        executor::Shared,
        queue::TaskQueue,
        task::Task,
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::rand::{
    rngs::SmallRng,
    SeedableRng,
};
use ::std::{
    sync::{
        atomic::{
            AtomicU8,
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

/// Longest time an idle worker sleeps when no wait task needs polling.
const IDLE_PARK_LIMIT: Duration = Duration::from_millis(50);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stealing = 2,
    Exiting = 3,
}

/// Per-worker scheduling state shared with the rest of the executor.
pub(crate) struct Worker {
    ordinal: usize,
    /// Tasks this worker runs next. Siblings steal from its back.
    pub(crate) queue: TaskQueue,
    /// Tasks handed to this worker by other threads.
    pub(crate) incoming: AtomicSlist<Task>,
    state: AtomicU8,
    /// Set by [Worker::wake] so that a wake-up racing with [Worker::park] is not lost.
    notified: Mutex<bool>,
    wakeup: Condvar,
    executed: AtomicUsize,
    steals: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Worker {
    pub(crate) fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            queue: TaskQueue::new(),
            incoming: AtomicSlist::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            notified: Mutex::new(false),
            wakeup: Condvar::new(),
            executed: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
        }
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Hands a ready task to this worker from any thread.
    pub(crate) fn submit(&self, task: Arc<Task>) {
        self.incoming.push(task);
        self.wake();
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.incoming.is_empty() || !self.queue.is_empty()
    }

    pub(crate) fn wake(&self) {
        let mut notified: MutexGuard<bool> = self.notified.lock();
        *notified = true;
        self.wakeup.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let mut notified: MutexGuard<bool> = self.notified.lock();
        if !*notified {
            self.wakeup.wait_for(&mut notified, timeout);
        }
        *notified = false;
    }

    pub(crate) fn note_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn steals(&self) -> usize {
        self.steals.load(Ordering::Relaxed)
    }
}

/// Body of a worker thread.
///
/// Local work always comes first: the incoming slist is flushed into the queue and the front task runs. With nothing
/// local, the worker tries to steal, then distributes external submissions, then polls parked wait tasks, and finally
/// parks. Once shutdown is requested the worker finishes what it holds and exits without stealing.
pub(crate) fn run(shared: Arc<Shared>, ordinal: usize) {
    let worker: &Worker = shared.worker(ordinal);
    let mut rng: SmallRng = SmallRng::seed_from_u64(ordinal as u64);
    info!("run(): worker {} started", ordinal);

    loop {
        worker.set_state(WorkerState::Running);
        if let Some(task) = worker.queue.flush_from_lifo_slist(&worker.incoming) {
            shared.execute(task, ordinal);
            continue;
        }

        if shared.is_exiting() {
            break;
        }

        worker.set_state(WorkerState::Stealing);
        if let Some(task) = shared.try_steal(ordinal, &mut rng) {
            shared.execute(task, ordinal);
            continue;
        }

        shared.coordinate();
        let has_waiters: bool = shared.poll_waiting(ordinal);
        if worker.has_work() {
            continue;
        }

        worker.set_state(WorkerState::Idle);
        let timeout: Duration = if has_waiters {
            shared.idle_timeout()
        } else {
            IDLE_PARK_LIMIT
        };
        worker.park(timeout);
    }

    worker.set_state(WorkerState::Exiting);
    info!("run(): worker {} exiting", ordinal);
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stealing,
            _ => WorkerState::Exiting,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Worker,
        WorkerState,
    };
    use crate::task::queue::tests::make_task;
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        thread,
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn wake_before_park_is_not_lost() -> Result<()> {
        let worker: Worker = Worker::new(0);
        worker.wake();
        let start: Instant = Instant::now();
        worker.park(Duration::from_secs(10));
        anyhow::ensure!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn wake_from_another_thread() -> Result<()> {
        let worker: Arc<Worker> = Arc::new(Worker::new(1));
        let waker: Arc<Worker> = worker.clone();
        let handle: thread::JoinHandle<()> = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.submit(make_task("remote"));
        });
        let start: Instant = Instant::now();
        while !worker.has_work() && start.elapsed() < Duration::from_secs(5) {
            worker.park(Duration::from_secs(1));
        }
        if handle.join().is_err() {
            anyhow::bail!("waker panicked");
        }
        crate::ensure_eq!(worker.has_work(), true);
        crate::ensure_eq!(worker.state(), WorkerState::Idle);
        crate::ensure_eq!(worker.ordinal(), 1);
        Ok(())
    }
}

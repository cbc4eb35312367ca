// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        collections::{
            AtomicSlist,
            FlushOrder,
            TaskList,
        },
        fail::Fail,
        logging,
        options::ExecutorOptions,
        time::Deadline,
    },
    task::{
        graph::{
            GraphHandle,
            Instance,
            TaskGraph,
        },
        scope::{
            Scope,
            TaskOutcome,
        },
        task::{
            DispatchFn,
            Task,
            TaskContext,
            TaskKind,
            TaskStatus,
            WaitSource,
            WorkgroupId,
        },
        worker::{
            self,
            Worker,
            WorkerState,
        },
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
};
use ::std::{
    any::Any,
    mem,
    panic::{
        self,
        AssertUnwindSafe,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Longest single sleep of a thread blocked in [Executor::wait_idle].
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

//======================================================================================================================
// Structures
//======================================================================================================================

/// A wait task whose condition did not hold yet.
struct ParkedWait {
    task: Arc<Task>,
    source: Arc<dyn WaitSource>,
    value: u64,
    deadline: Deadline,
}

/// State shared between the executor handle and its worker threads.
pub(crate) struct Shared {
    options: ExecutorOptions,
    workers: Vec<Worker>,
    /// Root tasks of submitted graphs, waiting to be handed to workers.
    incoming: AtomicSlist<Task>,
    /// Serializes distribution of `incoming`. Holds the round-robin cursor.
    coordinator: Mutex<usize>,
    /// Wait tasks polled by idle workers.
    waiting: Mutex<Vec<ParkedWait>>,
    /// Tasks submitted but not retired yet.
    outstanding: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    accepting: AtomicBool,
    exiting: AtomicBool,
}

/// Work-stealing task executor.
///
/// Owns a fixed pool of worker threads, each with its own ready queue. Graphs submitted from any thread are spread
/// across workers; tasks released by a completing task stay on the completing worker unless pinned elsewhere.
pub struct Executor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Shared {
    fn new(options: ExecutorOptions) -> Self {
        let workers: Vec<Worker> = (0..options.worker_count).map(Worker::new).collect();
        Self {
            options,
            workers,
            incoming: AtomicSlist::new(),
            coordinator: Mutex::new(0),
            waiting: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            accepting: AtomicBool::new(true),
            exiting: AtomicBool::new(false),
        }
    }

    pub(crate) fn worker(&self, ordinal: usize) -> &Worker {
        &self.workers[ordinal]
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    fn context(&self, ordinal: usize) -> TaskContext {
        TaskContext {
            worker_ordinal: ordinal,
            worker_count: self.workers.len(),
        }
    }

    /// Hands the roots of a graph to the workers.
    fn submit(&self, instance: Instance) -> Result<GraphHandle, Fail> {
        let Instance {
            scope,
            mut roots,
            task_count,
        } = instance;
        let handle: GraphHandle = GraphHandle::new(scope);
        if task_count == 0 {
            return Ok(handle);
        }
        self.outstanding.fetch_add(task_count, Ordering::AcqRel);
        debug!("submit(): graph={} tasks={} roots={}", handle.get_name(), task_count, roots.len());

        // The slist hands back a concatenated batch in reverse, so push it reversed to keep insertion order.
        roots.reverse();
        self.incoming.concat(&mut roots);
        self.coordinate();
        Ok(handle)
    }

    /// Distributes externally submitted tasks round-robin, honoring affinity.
    pub(crate) fn coordinate(&self) {
        if self.incoming.is_empty() {
            return;
        }
        let mut cursor: MutexGuard<usize> = self.coordinator.lock();
        let mut batch: TaskList<Task> = self.incoming.flush(FlushOrder::ApproximateFifo);
        while let Some(task) = batch.pop_front() {
            let target: usize = match task.affinity() {
                Some(ordinal) => ordinal,
                None => {
                    let ordinal: usize = *cursor % self.workers.len();
                    *cursor = cursor.wrapping_add(1);
                    ordinal
                },
            };
            self.workers[target].submit(task);
        }
    }

    /// Steals a batch from the sibling with the deepest queue. The scan starts at a random sibling so that ties do not
    /// always pick the same victim.
    pub(crate) fn try_steal(&self, ordinal: usize, rng: &mut SmallRng) -> Option<Arc<Task>> {
        let count: usize = self.workers.len();
        if count < 2 {
            return None;
        }
        let start: usize = rng.gen_range(0..count);
        let mut victim: Option<usize> = None;
        let mut deepest: usize = 0;
        for offset in 0..count {
            let candidate: usize = (start + offset) % count;
            if candidate == ordinal {
                continue;
            }
            let depth: usize = self.workers[candidate].queue.depth();
            if depth > deepest {
                victim = Some(candidate);
                deepest = depth;
            }
        }

        let victim: usize = victim?;
        let thief: &Worker = &self.workers[ordinal];
        let task: Arc<Task> = self.workers[victim]
            .queue
            .try_steal(&thief.queue, self.options.steal_batch_size)?;
        trace!("try_steal(): worker {} stole from worker {}", ordinal, victim);
        thief.note_steal();
        Some(task)
    }

    /// Runs a ready task on worker `ordinal` and retires it.
    pub(crate) fn execute(&self, task: Arc<Task>, ordinal: usize) {
        debug_assert_eq!(task.pending_dependencies(), 0);

        // Stolen or distributed tasks pinned elsewhere go back to their worker.
        if let Some(pinned) = task.affinity() {
            if pinned != ordinal {
                self.workers[pinned].submit(task);
                return;
            }
        }

        if task.is_aborted() || task.scope().is_cancelled() {
            drop(task.take_kind());
            self.retire(task, TaskOutcome::Aborted, ordinal);
            return;
        }

        let Some(kind) = task.take_kind() else {
            let cause: String = format!("task {} was scheduled twice", task.get_name());
            error!("execute(): {}", cause);
            task.scope().fail(Fail::new(libc::EIO, &cause));
            self.retire(task, TaskOutcome::Failed, ordinal);
            return;
        };

        task.set_status(TaskStatus::Executing);
        self.workers[ordinal].note_executed();
        let context: TaskContext = self.context(ordinal);
        let result: Result<(), Fail> = match kind {
            TaskKind::Call(f) => guarded(&task, || f(&context)),
            TaskKind::Barrier => Ok(()),
            TaskKind::Wait {
                source,
                value,
                deadline,
            } => {
                let parked: ParkedWait = ParkedWait {
                    task,
                    source,
                    value,
                    deadline,
                };
                match Self::check_wait(&parked) {
                    Some(result) => {
                        let ParkedWait { task, .. } = parked;
                        self.finish(task, result, ordinal);
                    },
                    None => {
                        trace!("execute(): parking wait task {}", parked.task.get_name());
                        self.waiting.lock().push(parked);
                    },
                }
                return;
            },
            TaskKind::Dispatch {
                workgroup_count,
                slice_size,
                kernel,
            } => self.fan_out(&task, ordinal, workgroup_count, slice_size, kernel),
            TaskKind::DispatchSlice {
                workgroup_count,
                workgroups,
                kernel,
            } => guarded(&task, || {
                for index in workgroups {
                    kernel(&context, WorkgroupId::from_linear(index, workgroup_count))?;
                }
                Ok(())
            }),
        };
        self.finish(task, result, ordinal);
    }

    fn finish(&self, task: Arc<Task>, result: Result<(), Fail>, ordinal: usize) {
        let outcome: TaskOutcome = match result {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                warn!("execute(): task {} failed: {:?}", task.get_name(), e);
                task.scope().fail(e);
                TaskOutcome::Failed
            },
        };
        self.retire(task, outcome, ordinal);
    }

    /// Returns the result of a wait task if its condition is settled.
    fn check_wait(parked: &ParkedWait) -> Option<Result<(), Fail>> {
        match parked.source.is_reached(parked.value) {
            Ok(true) => Some(Ok(())),
            Ok(false) if parked.deadline.has_expired() => {
                let cause: String = format!(
                    "wait task {} did not reach {} before the deadline",
                    parked.task.get_name(),
                    parked.value
                );
                Some(Err(Fail::new(libc::ETIMEDOUT, &cause)))
            },
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Polls parked wait tasks and retires the settled ones. Returns true if some remain parked.
    pub(crate) fn poll_waiting(&self, ordinal: usize) -> bool {
        let parked: Vec<ParkedWait> = {
            let mut waiting: MutexGuard<Vec<ParkedWait>> = self.waiting.lock();
            if waiting.is_empty() {
                return false;
            }
            mem::take(&mut *waiting)
        };

        let mut unsettled: Vec<ParkedWait> = Vec::new();
        for wait in parked {
            if wait.task.scope().is_cancelled() {
                self.retire(wait.task, TaskOutcome::Aborted, ordinal);
                continue;
            }
            match Self::check_wait(&wait) {
                Some(result) => self.finish(wait.task, result, ordinal),
                None => unsettled.push(wait),
            }
        }

        if unsettled.is_empty() {
            return !self.waiting.lock().is_empty();
        }
        self.waiting.lock().extend(unsettled);
        true
    }

    /// Splits a dispatch into slices spread over the workers. A hidden barrier joins the slices and takes over the
    /// dependents of the dispatch.
    fn fan_out(
        &self,
        task: &Arc<Task>,
        ordinal: usize,
        workgroup_count: [u32; 3],
        slice_size: u32,
        kernel: DispatchFn,
    ) -> Result<(), Fail> {
        let total: u64 = match workgroup_count
            .iter()
            .try_fold(1u64, |total, count| total.checked_mul(*count as u64))
        {
            Some(total) => total,
            None => {
                let cause: String = format!("dispatch {} grid {:?} is too large", task.get_name(), workgroup_count);
                error!("fan_out(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if total == 0 {
            return Ok(());
        }
        let slice_size: u64 = slice_size as u64;
        // `total` is non-zero here.
        let slice_count: u64 = (total - 1) / slice_size + 1;
        if slice_count > u32::MAX as u64 {
            let cause: String = format!("dispatch {} has too many slices ({})", task.get_name(), slice_count);
            error!("fan_out(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let scope: &Arc<Scope> = task.scope();
        let join: Arc<Task> = Task::new(
            format!("{}/join", task.get_name()),
            TaskKind::Barrier,
            slice_count as u32,
            task.take_dependents(),
            None,
            scope.clone(),
        );
        scope.add_pending(slice_count as usize + 1);
        self.outstanding.fetch_add(slice_count as usize + 1, Ordering::AcqRel);
        trace!("fan_out(): dispatch={} workgroups={} slices={}", task.get_name(), total, slice_count);

        for slice in 0..slice_count {
            let start: u64 = slice * slice_size;
            let end: u64 = start.saturating_add(slice_size).min(total);
            let slice_task: Arc<Task> = Task::new(
                format!("{}/{}", task.get_name(), slice),
                TaskKind::DispatchSlice {
                    workgroup_count,
                    workgroups: start..end,
                    kernel: kernel.clone(),
                },
                0,
                vec![join.clone()],
                None,
                scope.clone(),
            );
            let target: usize = (ordinal + slice as usize) % self.workers.len();
            if target == ordinal {
                self.workers[ordinal].incoming.push(slice_task);
            } else {
                self.workers[target].submit(slice_task);
            }
        }
        Ok(())
    }

    /// Records the outcome of a task and releases its dependents. Dependents stay on this worker unless pinned
    /// elsewhere. An unsuccessful task aborts its dependents.
    fn retire(&self, task: Arc<Task>, outcome: TaskOutcome, ordinal: usize) {
        task.set_status(match outcome {
            TaskOutcome::Completed => TaskStatus::Completed,
            TaskOutcome::Failed => TaskStatus::Failed,
            TaskOutcome::Aborted => TaskStatus::Aborted,
        });

        let mut released: usize = 0;
        for dependent in task.take_dependents() {
            if outcome != TaskOutcome::Completed {
                dependent.abort();
            }
            if dependent.release_dependency() {
                match dependent.affinity() {
                    Some(pinned) if pinned != ordinal => self.workers[pinned].submit(dependent),
                    _ => {
                        self.workers[ordinal].incoming.push(dependent);
                        released += 1;
                    },
                }
            }
        }
        if released > 1 {
            self.wake_idle_sibling(ordinal);
        }

        let scope: Arc<Scope> = task.scope().clone();
        drop(task);
        scope.retire(outcome);
        self.retire_outstanding(1);
    }

    /// Wakes one idle worker other than `ordinal` so that it can steal surplus work.
    fn wake_idle_sibling(&self, ordinal: usize) {
        if let Some(sibling) = self
            .workers
            .iter()
            .find(|worker| worker.ordinal() != ordinal && worker.state() == WorkerState::Idle)
        {
            sibling.wake();
        }
    }

    fn retire_outstanding(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous: usize = self.outstanding.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count);
        if previous == count {
            let _guard: MutexGuard<()> = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, deadline: Deadline) -> Result<(), Fail> {
        let mut guard: MutexGuard<()> = self.idle_lock.lock();
        loop {
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            if deadline.has_expired() {
                let cause: String = format!(
                    "{} tasks still outstanding at the deadline",
                    self.outstanding.load(Ordering::Acquire)
                );
                return Err(Fail::new(libc::ETIMEDOUT, &cause));
            }
            self.idle.wait_for(&mut guard, deadline.next_wakeup(WAIT_INTERVAL));
        }
    }

    /// Aborts every task left behind after the workers exited, following dependency edges so that every graph
    /// completes.
    fn teardown(&self) {
        let mut leftovers: TaskList<Task> = self.incoming.flush(FlushOrder::ApproximateFifo);
        for worker in &self.workers {
            leftovers.append(&mut worker.queue.take_all());
            leftovers.append(&mut worker.incoming.flush(FlushOrder::ApproximateFifo));
        }
        for wait in mem::take(&mut *self.waiting.lock()) {
            leftovers.push_back(wait.task);
        }
        if leftovers.is_empty() {
            return;
        }

        warn!("teardown(): discarding {} ready tasks", leftovers.len());
        let mut discarded: usize = 0;
        while let Some(task) = leftovers.pop_front() {
            drop(task.take_kind());
            task.set_status(TaskStatus::Aborted);
            for dependent in task.take_dependents() {
                dependent.abort();
                if dependent.release_dependency() {
                    leftovers.push_back(dependent);
                }
            }
            let scope: Arc<Scope> = task.scope().clone();
            drop(task);
            scope.fail(Fail::new(libc::ECANCELED, "executor shut down before the task ran"));
            scope.retire(TaskOutcome::Aborted);
            discarded += 1;
        }
        self.retire_outstanding(discarded);
    }
}

impl Executor {
    /// Spawns the worker threads.
    pub fn new(options: ExecutorOptions) -> Result<Self, Fail> {
        logging::initialize();
        if options.worker_count == 0 || options.steal_batch_size == 0 {
            let cause: String = format!("invalid executor options: {:?}", options);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let worker_count: usize = options.worker_count;
        let executor: Executor = Executor {
            shared: Arc::new(Shared::new(options)),
            threads: Mutex::new(Vec::with_capacity(worker_count)),
        };
        for ordinal in 0..worker_count {
            let shared: Arc<Shared> = executor.shared.clone();
            let handle: thread::JoinHandle<()> = thread::Builder::new()
                .name(format!("taskhal-worker-{}", ordinal))
                .spawn(move || worker::run(shared, ordinal))?;
            executor.threads.lock().push(handle);
        }
        info!("new(): started {} workers", worker_count);
        Ok(executor)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Submits a graph for execution and returns a handle to observe it.
    pub fn submit(&self, graph: TaskGraph) -> Result<GraphHandle, Fail> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            let cause: String = format!("cannot submit graph {}: executor is shutting down", graph.get_name());
            warn!("submit(): {}", cause);
            return Err(Fail::new(libc::ECANCELED, &cause));
        }
        let instance: Instance = graph.instantiate(self.worker_count())?;
        self.shared.submit(instance)
    }

    /// Blocks until no submitted task is outstanding, or `deadline` expires.
    pub fn wait_idle(&self, deadline: Deadline) -> Result<(), Fail> {
        self.shared.wait_idle(deadline)
    }

    /// Number of tasks submitted and not retired yet.
    pub fn outstanding_tasks(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.workers.iter().map(Worker::state).collect()
    }

    /// Number of tasks each worker has run.
    pub fn executed_per_worker(&self) -> Vec<usize> {
        self.shared.workers.iter().map(Worker::executed).collect()
    }

    /// Number of successful steals performed by all workers.
    pub fn steal_count(&self) -> usize {
        self.shared.workers.iter().map(Worker::steals).sum()
    }

    /// Stops accepting submissions, lets workers finish the tasks they hold, joins them and aborts whatever is left.
    pub fn shutdown(&self) -> Result<(), Fail> {
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            info!("shutdown(): stopping {} workers", self.worker_count());
        }
        self.shared.exiting.store(true, Ordering::Release);
        for worker in &self.shared.workers {
            worker.wake();
        }

        let threads: Vec<thread::JoinHandle<()>> = mem::take(&mut *self.threads.lock());
        let mut panicked: usize = 0;
        for handle in threads {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        self.shared.teardown();

        if panicked > 0 {
            let cause: String = format!("{} worker threads panicked", panicked);
            error!("shutdown(): {}", cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        Ok(())
    }
}

/// Runs a task body, turning a panic into a task error.
fn guarded<F>(task: &Task, f: F) -> Result<(), Fail>
where
    F: FnOnce() -> Result<(), Fail>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let cause: String = format!("task {} panicked: {}", task.get_name(), panic_message(&*payload));
            error!("guarded(): {}", cause);
            Err(Fail::new(libc::EIO, &cause))
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("drop(): {:?}", e);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hal::{
        backend::DeviceBackend,
        command_buffer::{
            CommandBuffer,
            CommandBufferState,
        },
        event::Event,
        semaphore::{
            wait_semaphores,
            TimelineSemaphore,
            WaitMode,
        },
        timepoint::{
            TimePointFence,
            TimePointFencePool,
            TimePointSemaphore,
            TimePointSemaphorePool,
        },
    },
    runtime::{
        fail::Fail,
        options::DeviceOptions,
        time::Deadline,
    },
    task::{
        Executor,
        GraphHandle,
        TaskGraph,
        TaskId,
        WaitSource,
    },
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::std::{
    fmt,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Semaphores paired with the payload values a submission waits for or signals.
#[derive(Clone, Default)]
pub struct SemaphoreList {
    semaphores: Vec<TimelineSemaphore>,
    values: Vec<u64>,
}

/// One unit of queue work: wait on `wait`, run `command_buffers` in order, then signal `signal`.
#[derive(Default)]
pub struct SubmissionBatch {
    pub wait: SemaphoreList,
    pub command_buffers: Vec<CommandBuffer>,
    pub signal: SemaphoreList,
}

/// A batch whose fence and timepoints were taken from the pools but which is not submitted yet.
struct ReservedBatch {
    wait: SemaphoreList,
    command_buffers: Vec<CommandBuffer>,
    signal: Vec<TimelineSemaphore>,
    timepoints: Vec<TimePointSemaphore>,
    fence: TimePointFence,
}

struct QueueState {
    /// Last batch submitted to the queue.
    tail: Option<GraphHandle>,
    submitted: u64,
}

/// Completes once the previous batch of a queue retired. A lost device fails every later batch of the queue.
struct QueueTail {
    handle: GraphHandle,
}

/// Logical device executing queue submissions on a shared [Executor].
pub struct Device {
    name: String,
    executor: Arc<Executor>,
    fences: TimePointFencePool,
    timepoints: TimePointSemaphorePool,
    queues: Vec<Mutex<QueueState>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SemaphoreList {
    pub fn new(semaphores: Vec<TimelineSemaphore>, values: Vec<u64>) -> Result<Self, Fail> {
        if semaphores.len() != values.len() {
            let cause: String = format!("{} semaphores but {} values", semaphores.len(), values.len());
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(Self { semaphores, values })
    }

    pub fn push(&mut self, semaphore: TimelineSemaphore, value: u64) {
        self.semaphores.push(semaphore);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    pub fn semaphores(&self) -> &[TimelineSemaphore] {
        &self.semaphores
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TimelineSemaphore, u64)> {
        self.semaphores.iter().zip(self.values.iter().copied())
    }
}

impl SubmissionBatch {
    pub fn new(wait: SemaphoreList, command_buffers: Vec<CommandBuffer>, signal: SemaphoreList) -> Self {
        Self {
            wait,
            command_buffers,
            signal,
        }
    }
}

impl ReservedBatch {
    /// Fails every semaphore the batch was going to signal.
    fn fail_signals(signal: &[TimelineSemaphore], e: &Fail) {
        for semaphore in signal {
            semaphore.fail(e.clone());
        }
    }
}

impl Device {
    /// Creates a device with `options.queue_count` queues. Fence and timepoint pools are sized once here and never grow.
    pub fn new(
        name: &str,
        backend: Arc<dyn DeviceBackend>,
        executor: Arc<Executor>,
        options: DeviceOptions,
    ) -> Result<Self, Fail> {
        if options.queue_count == 0 {
            let cause: String = format!("device {} needs at least one queue", name);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let fences: TimePointFencePool = TimePointFencePool::new(backend, options.max_in_flight_fences)?;
        let timepoints: TimePointSemaphorePool = TimePointSemaphorePool::new(options.max_in_flight_semaphores)?;
        let queues: Vec<Mutex<QueueState>> = (0..options.queue_count)
            .map(|_| {
                Mutex::new(QueueState {
                    tail: None,
                    submitted: 0,
                })
            })
            .collect();
        info!(
            "new(): device={} queues={} fences={} timepoints={}",
            name, options.queue_count, options.max_in_flight_fences, options.max_in_flight_semaphores
        );
        Ok(Self {
            name: name.to_string(),
            executor,
            fences,
            timepoints,
            queues,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn fence_pool(&self) -> &TimePointFencePool {
        &self.fences
    }

    pub fn timepoint_pool(&self) -> &TimePointSemaphorePool {
        &self.timepoints
    }

    pub fn create_semaphore(&self, initial_value: u64) -> TimelineSemaphore {
        TimelineSemaphore::new(initial_value, self.timepoints.clone())
    }

    pub fn create_event(&self) -> Event {
        Event::new()
    }

    pub fn create_command_buffer(&self, name: &str) -> CommandBuffer {
        CommandBuffer::new(name)
    }

    /// Blocks until one or all of the semaphores in `list` reach their values.
    pub fn wait_semaphores(&self, mode: WaitMode, list: &SemaphoreList, deadline: Deadline) -> Result<(), Fail> {
        wait_semaphores(mode, list.semaphores(), list.values(), deadline)
    }

    /// Submits `batches` to the lowest queue selected by the `queue_affinity` bitmask.
    ///
    /// Every fence and timepoint the batches need is reserved before anything runs: a pool that runs dry fails the
    /// call with `EAGAIN` and nothing is submitted. Batches on one queue start in submission order.
    pub fn queue_submit(&self, queue_affinity: u64, batches: Vec<SubmissionBatch>) -> Result<(), Fail> {
        let queue: usize = self.select_queue(queue_affinity)?;
        if batches.is_empty() {
            return Ok(());
        }
        let reserved: Vec<ReservedBatch> = self.reserve(batches)?;

        let mut state: MutexGuard<QueueState> = self.queues[queue].lock();
        for batch in reserved {
            let name: String = format!("{}/queue{}/{}", self.name, queue, state.submitted);
            state.submitted += 1;
            match self.launch(&name, state.tail.clone(), batch) {
                Ok(handle) => state.tail = Some(handle),
                Err(e) => {
                    error!("queue_submit(): batch {} was not submitted: {:?}", name, e);
                    return Err(e);
                },
            }
        }
        Ok(())
    }

    /// Blocks until every batch submitted so far retired. Fails on an expired deadline or a lost device.
    pub fn wait_idle(&self, deadline: Deadline) -> Result<(), Fail> {
        for queue in &self.queues {
            let tail: Option<GraphHandle> = queue.lock().tail.clone();
            if let Some(handle) = tail {
                match handle.wait(deadline) {
                    Err(e) if e.is_deadline_exceeded() || e.is_device_lost() => return Err(e),
                    _ => {},
                }
            }
        }
        Ok(())
    }

    fn select_queue(&self, queue_affinity: u64) -> Result<usize, Fail> {
        let queue_count: usize = self.queues.len();
        let valid: u64 = if queue_count >= 64 {
            u64::MAX
        } else {
            (1u64 << queue_count) - 1
        };
        if queue_affinity == 0 || queue_affinity & !valid != 0 {
            let cause: String = format!(
                "queue affinity {:#x} does not select one of the {} queues of device {}",
                queue_affinity, queue_count, self.name
            );
            error!("select_queue(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(queue_affinity.trailing_zeros() as usize)
    }

    /// Validates every batch and takes their fences and timepoints out of the pools. Reserved resources go back to
    /// their pools on error.
    fn reserve(&self, batches: Vec<SubmissionBatch>) -> Result<Vec<ReservedBatch>, Fail> {
        let mut scheduled: Vec<(TimelineSemaphore, u64)> = Vec::new();
        for batch in &batches {
            for command_buffer in &batch.command_buffers {
                if command_buffer.state() != CommandBufferState::Executable {
                    let cause: String = format!(
                        "command buffer {} is not executable (state {:?})",
                        command_buffer.get_name(),
                        command_buffer.state()
                    );
                    error!("reserve(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
            }
            for (semaphore, value) in batch.signal.iter() {
                semaphore.validate_signal(value)?;
                let previous: Option<u64> = scheduled
                    .iter()
                    .filter(|(other, _)| other.ptr_eq(semaphore))
                    .map(|(_, v)| *v)
                    .max();
                if let Some(previous) = previous {
                    if value <= previous {
                        let cause: String =
                            format!("signal value {} does not exceed value {} of an earlier batch", value, previous);
                        error!("reserve(): {}", cause);
                        return Err(Fail::new(libc::EINVAL, &cause));
                    }
                }
                scheduled.push((semaphore.clone(), value));
            }
        }

        let mut reserved: Vec<ReservedBatch> = Vec::with_capacity(batches.len());
        for batch in batches {
            let fence: TimePointFence = self.fences.acquire()?;
            let mut timepoints: Vec<TimePointSemaphore> = Vec::with_capacity(batch.signal.len());
            for (_, value) in batch.signal.iter() {
                let mut timepoint: TimePointSemaphore = self.timepoints.acquire(value)?;
                timepoint.set_signal_fence(fence.clone());
                timepoints.push(timepoint);
            }
            reserved.push(ReservedBatch {
                wait: batch.wait,
                command_buffers: batch.command_buffers,
                signal: batch.signal.semaphores,
                timepoints,
                fence,
            });
        }
        Ok(reserved)
    }

    /// Launches `batch`. A batch that fails to launch leaves no pending signal or wait behind on its semaphores.
    fn launch(&self, name: &str, previous: Option<GraphHandle>, batch: ReservedBatch) -> Result<GraphHandle, Fail> {
        let fence: TimePointFence = batch.fence.clone();
        let touched: Vec<TimelineSemaphore> = batch
            .signal
            .iter()
            .chain(batch.wait.semaphores())
            .cloned()
            .collect();
        self.build(name, previous, batch).map_err(|e| {
            for semaphore in &touched {
                semaphore.abandon_fence(&fence);
            }
            e
        })
    }

    /// Registers the pending signals of `batch`, lowers it to a task graph and hands the graph to the executor.
    fn build(&self, name: &str, previous: Option<GraphHandle>, batch: ReservedBatch) -> Result<GraphHandle, Fail> {
        let ReservedBatch {
            wait,
            command_buffers,
            signal,
            timepoints,
            fence,
        } = batch;

        for (semaphore, timepoint) in signal.iter().zip(timepoints) {
            semaphore.enqueue_signal(timepoint)?;
        }

        let mut graph: TaskGraph = TaskGraph::new(name);
        let mut tail: Vec<TaskId> = Vec::with_capacity(wait.len() + 1);
        if let Some(handle) = previous {
            let source: Arc<dyn WaitSource> = Arc::new(QueueTail { handle });
            tail.push(graph.wait("queue", &[], source, 0, Deadline::InfiniteFuture)?);
        }
        for (index, (semaphore, value)) in wait.iter().enumerate() {
            if semaphore.attach_wait_fence(value, &fence)? {
                trace!("build(): batch={} holds the device signal of {}", name, value);
            }
            let source: Arc<dyn WaitSource> = Arc::new(semaphore.clone());
            let wait_name: String = format!("wait{}", index);
            tail.push(graph.wait(&wait_name, &[], source, value, Deadline::InfiniteFuture)?);
        }
        for command_buffer in command_buffers {
            tail = command_buffer.lower(&mut graph, tail)?;
        }

        let signaled: Vec<TimelineSemaphore> = signal.clone();
        let waited: Vec<TimelineSemaphore> = wait.semaphores().to_vec();
        let released: Vec<TimelineSemaphore> = waited.clone();
        let batch_fence: TimePointFence = fence.clone();
        graph.call("signal", &tail, move |_| {
            batch_fence.signal()?;
            for semaphore in &signaled {
                semaphore.query()?;
            }
            // Returns the timepoints this batch held. Its waits were satisfied, so a failure here does not fail it.
            for semaphore in &released {
                if let Err(e) = semaphore.query() {
                    debug!("signal(): waited semaphore failed after the wait: {:?}", e);
                }
            }
            Ok(())
        })?;
        let batch_name: String = name.to_string();
        graph.on_complete(move |result| {
            if let Err(e) = result {
                warn!("queue_submit(): batch {} failed: {:?}", batch_name, e);
                ReservedBatch::fail_signals(&signal, &e);
                for semaphore in &waited {
                    semaphore.abandon_fence(&fence);
                }
            }
        });

        self.executor.submit(graph)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl WaitSource for QueueTail {
    fn is_reached(&self, _value: u64) -> Result<bool, Fail> {
        match self.handle.status() {
            None => Ok(false),
            Some(Err(e)) if e.is_device_lost() => Err(e),
            Some(_) => Ok(true),
        }
    }
}

impl fmt::Debug for SemaphoreList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreList")
            .field("semaphores", &self.semaphores.len())
            .field("values", &self.values)
            .finish()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("queues", &self.queues.len())
            .field("fences", &self.fences)
            .field("timepoints", &self.timepoints)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

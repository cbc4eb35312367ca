// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};
use ::taskhal::{
    ensure_eq,
    CommandBuffer,
    Deadline,
    Device,
    DeviceOptions,
    Event,
    Executor,
    ExecutorOptions,
    Fail,
    HostBackend,
    SemaphoreList,
    SubmissionBatch,
    TimelineSemaphore,
    WaitMode,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const TIMEOUT: Duration = Duration::from_secs(30);

//======================================================================================================================
// Helpers
//======================================================================================================================

fn device(options: DeviceOptions) -> Result<Device> {
    let executor: Arc<Executor> = Arc::new(Executor::new(ExecutorOptions::default().worker_count(4))?);
    Ok(Device::new("integration", Arc::new(HostBackend::new()), executor, options)?)
}

fn list(semaphore: &TimelineSemaphore, value: u64) -> SemaphoreList {
    let mut list: SemaphoreList = SemaphoreList::default();
    list.push(semaphore.clone(), value);
    list
}

/// Command buffer that adds the workgroup count of a `[8, 8, 1]` grid to `total`.
fn accumulate(device: &Device, total: &Arc<AtomicU64>) -> Result<CommandBuffer> {
    let total: Arc<AtomicU64> = total.clone();
    let mut buffer: CommandBuffer = device.create_command_buffer("accumulate");
    buffer.begin()?;
    buffer.dispatch([8, 8, 1], 16, move |_, _| {
        total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })?;
    buffer.execution_barrier()?;
    buffer.end()?;
    Ok(buffer)
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Tests that consecutive batches chained through one timeline all run and advance it.
#[test]
fn batches_advance_a_timeline() -> Result<()> {
    const BATCHES: u64 = 8;
    let device: Device = device(DeviceOptions::default())?;
    let timeline: TimelineSemaphore = device.create_semaphore(0);
    let total: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let mut batches: Vec<SubmissionBatch> = Vec::new();
    for value in 1..=BATCHES {
        let wait: SemaphoreList = match value {
            1 => SemaphoreList::default(),
            _ => list(&timeline, value - 1),
        };
        batches.push(SubmissionBatch::new(
            wait,
            vec![accumulate(&device, &total)?],
            list(&timeline, value),
        ));
    }
    device.queue_submit(0b1, batches)?;

    timeline.wait(BATCHES, Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(total.load(Ordering::Relaxed), BATCHES * 64);
    device.wait_idle(Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(device.timepoint_pool().in_flight_count(), 0);
    ensure_eq!(device.fence_pool().in_flight_count(), 0);
    Ok(())
}

/// Tests that a caller can back off on an exhausted fence pool and resubmit once capacity frees up.
#[test]
fn exhaustion_applies_backpressure() -> Result<()> {
    const SUBMISSIONS: u64 = 32;
    let device: Device = device(DeviceOptions::default().max_in_flight_fences(2))?;
    let timeline: TimelineSemaphore = device.create_semaphore(0);
    let total: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let mut retries: usize = 0;
    let mut value: u64 = 1;
    while value <= SUBMISSIONS {
        let batch: SubmissionBatch =
            SubmissionBatch::new(SemaphoreList::default(), vec![accumulate(&device, &total)?], list(&timeline, value));
        match device.queue_submit(0b1, vec![batch]) {
            Ok(()) => value += 1,
            Err(e) if e.should_retry() => {
                retries += 1;
                timeline.wait(value - 1, Deadline::from_timeout(TIMEOUT))?;
                device.wait_idle(Deadline::from_timeout(TIMEOUT))?;
            },
            Err(e) => return Err(e.into()),
        }
        ensure_eq!(device.fence_pool().in_flight_count() <= 2, true);
    }

    timeline.wait(SUBMISSIONS, Deadline::from_timeout(TIMEOUT))?;
    device.wait_idle(Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(total.load(Ordering::Relaxed), SUBMISSIONS * 64);
    ensure_eq!(device.fence_pool().free_count(), 2);
    log::debug!("exhaustion_applies_backpressure(): {} retries", retries);
    Ok(())
}

/// Tests that events set earlier in a queue are visible to later commands of the same queue.
#[test]
fn events_follow_queue_order() -> Result<()> {
    let device: Device = device(DeviceOptions::default())?;
    let event: Event = device.create_event();
    let done: TimelineSemaphore = device.create_semaphore(0);

    let mut producer: CommandBuffer = device.create_command_buffer("producer");
    producer.begin()?;
    producer.signal_event(&event)?;
    producer.end()?;

    let observed: Event = event.clone();
    let mut consumer: CommandBuffer = device.create_command_buffer("consumer");
    consumer.begin()?;
    consumer.wait_events(&[event.clone()])?;
    consumer.call(move |_| match observed.is_signaled() {
        true => Ok(()),
        false => Err(Fail::new(libc::EIO, "event not signaled")),
    })?;
    consumer.reset_event(&event)?;
    consumer.end()?;

    device.queue_submit(
        0b1,
        vec![SubmissionBatch::new(
            SemaphoreList::default(),
            vec![producer, consumer],
            list(&done, 1),
        )],
    )?;
    done.wait(1, Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(event.is_signaled(), false);
    Ok(())
}

/// Tests multi-waits over semaphores signaled by different queues.
#[test]
fn multi_wait_across_queues() -> Result<()> {
    let device: Device = device(DeviceOptions::default().queue_count(2))?;
    let gate: TimelineSemaphore = device.create_semaphore(0);
    let left: TimelineSemaphore = device.create_semaphore(0);
    let right: TimelineSemaphore = device.create_semaphore(0);

    device.queue_submit(
        0b01,
        vec![SubmissionBatch::new(SemaphoreList::default(), vec![], list(&left, 1))],
    )?;
    device.queue_submit(
        0b10,
        vec![SubmissionBatch::new(list(&gate, 1), vec![], list(&right, 1))],
    )?;

    let both: SemaphoreList = SemaphoreList::new(vec![left.clone(), right.clone()], vec![1, 1])?;
    device.wait_semaphores(WaitMode::Any, &both, Deadline::from_timeout(TIMEOUT))?;
    match device.wait_semaphores(WaitMode::All, &both, Deadline::from_timeout(Duration::from_millis(20))) {
        Err(e) => ensure_eq!(e.is_deadline_exceeded(), true),
        Ok(()) => anyhow::bail!("right semaphore is gated by the host"),
    }

    gate.signal(1)?;
    device.wait_semaphores(WaitMode::All, &both, Deadline::from_timeout(TIMEOUT))?;
    device.wait_idle(Deadline::from_timeout(TIMEOUT))?;
    Ok(())
}

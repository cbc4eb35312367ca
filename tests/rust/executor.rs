// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    self,
    Receiver,
    Sender,
};
use ::std::{
    collections::HashSet,
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
    task::{
        ScopeCounters,
        WaitSource,
        WorkgroupId,
    },
    Deadline,
    Executor,
    ExecutorOptions,
    Fail,
    GraphHandle,
    TaskGraph,
    TaskId,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const TIMEOUT: Duration = Duration::from_secs(30);

//======================================================================================================================
// Helpers
//======================================================================================================================

fn executor(worker_count: usize) -> Result<Executor> {
    Ok(Executor::new(ExecutorOptions::default().worker_count(worker_count))?)
}

/// Adds a task that reports `name` on `tx` when it runs.
fn report(graph: &mut TaskGraph, name: &'static str, deps: &[TaskId], tx: &Sender<&'static str>) -> Result<TaskId> {
    let tx: Sender<&'static str> = tx.clone();
    Ok(graph.call(name, deps, move |_| {
        tx.send(name)
            .map_err(|_| Fail::new(libc::EIO, "report channel closed"))
    })?)
}

/// Host counter that wait tasks can block on.
#[derive(Default)]
struct Counter(AtomicU64);

impl WaitSource for Counter {
    fn is_reached(&self, value: u64) -> Result<bool, Fail> {
        Ok(self.0.load(Ordering::Acquire) >= value)
    }
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Tests that a task runs only after every task it depends on.
#[test]
fn dependencies_order_execution() -> Result<()> {
    let executor: Executor = executor(4)?;
    for _ in 0..100 {
        let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();
        let mut graph: TaskGraph = TaskGraph::new("diamond");
        let a: TaskId = report(&mut graph, "a", &[], &tx)?;
        let b: TaskId = report(&mut graph, "b", &[], &tx)?;
        graph.pin(a, 0)?;
        graph.pin(b, 1)?;
        report(&mut graph, "c", &[a, b], &tx)?;
        drop(tx);

        let handle: GraphHandle = executor.submit(graph)?;
        handle.wait(Deadline::from_timeout(TIMEOUT))?;
        let order: Vec<&'static str> = rx.iter().collect();
        ensure_eq!(order.len(), 3);
        ensure_eq!(order[2], "c");
    }
    executor.shutdown()?;
    Ok(())
}

/// Tests that every task of a wide graph runs exactly once while workers steal from each other.
#[test]
fn wide_graph_runs_every_task_once() -> Result<()> {
    const TASKS: usize = 2000;
    let executor: Executor = executor(4)?;
    let (tx, rx): (Sender<usize>, Receiver<usize>) = crossbeam_channel::unbounded();

    let mut graph: TaskGraph = TaskGraph::new("wide");
    let root: TaskId = graph.barrier("root", &[])?;
    for i in 0..TASKS {
        let tx: Sender<usize> = tx.clone();
        graph.call("leaf", &[root], move |_| {
            ::std::thread::sleep(Duration::from_micros(20));
            tx.send(i).map_err(|_| Fail::new(libc::EIO, "leaf channel closed"))
        })?;
    }
    drop(tx);

    let handle: GraphHandle = executor.submit(graph)?;
    handle.wait(Deadline::from_timeout(TIMEOUT))?;
    let mut seen: Vec<usize> = rx.iter().collect();
    seen.sort_unstable();
    ensure_eq!(seen, (0..TASKS).collect::<Vec<usize>>());

    executor.wait_idle(Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(executor.executed_per_worker().iter().sum::<usize>(), TASKS + 1);
    ensure_eq!(executor.outstanding_tasks(), 0);
    executor.shutdown()?;
    Ok(())
}

/// Tests that a failing task aborts its own continuation but not an independent chain.
#[test]
fn failure_stays_within_its_chain() -> Result<()> {
    let executor: Executor = executor(2)?;
    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();
    let mut graph: TaskGraph = TaskGraph::new("chains");
    let broken: TaskId = graph.call("broken", &[], |_| Err(Fail::new(libc::EIO, "bad input")))?;
    report(&mut graph, "after-broken", &[broken], &tx)?;
    let healthy: TaskId = report(&mut graph, "healthy", &[], &tx)?;
    report(&mut graph, "after-healthy", &[healthy], &tx)?;
    drop(tx);

    let handle: GraphHandle = executor.submit(graph)?;
    match handle.wait(Deadline::from_timeout(TIMEOUT)) {
        Err(e) => ensure_eq!(e.errno, libc::EIO),
        Ok(()) => anyhow::bail!("graph with a failing task should fail"),
    }
    let ran: HashSet<&'static str> = rx.iter().collect();
    ensure_eq!(ran, HashSet::from(["healthy", "after-healthy"]));
    ensure_eq!(
        handle.counters(),
        ScopeCounters {
            completed: 2,
            failed: 1,
            aborted: 1,
            pending: 0,
        }
    );
    Ok(())
}

/// Tests that a dispatch visits every workgroup of a three-dimensional grid exactly once.
#[test]
fn dispatch_covers_the_grid() -> Result<()> {
    let executor: Executor = executor(3)?;
    let (tx, rx): (Sender<(u32, u32, u32)>, Receiver<(u32, u32, u32)>) = crossbeam_channel::unbounded();
    let mut graph: TaskGraph = TaskGraph::new("grid");
    graph.dispatch("kernel", &[], [5, 4, 3], 4, move |_, id: WorkgroupId| {
        tx.send((id.x, id.y, id.z))
            .map_err(|_| Fail::new(libc::EIO, "grid channel closed"))
    })?;

    executor.submit(graph)?.wait(Deadline::from_timeout(TIMEOUT))?;
    let mut visited: Vec<(u32, u32, u32)> = rx.iter().collect();
    visited.sort_unstable();
    let mut expected: Vec<(u32, u32, u32)> = Vec::new();
    for x in 0..5 {
        for y in 0..4 {
            for z in 0..3 {
                expected.push((x, y, z));
            }
        }
    }
    ensure_eq!(visited, expected);
    Ok(())
}

/// Tests that a wait task holds back its dependents until the host reaches the value.
#[test]
fn wait_task_blocks_dependents() -> Result<()> {
    let executor: Executor = executor(2)?;
    let counter: Arc<Counter> = Arc::new(Counter::default());
    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();

    let mut graph: TaskGraph = TaskGraph::new("gated");
    let gate: TaskId = graph.wait("gate", &[], counter.clone(), 2, Deadline::InfiniteFuture)?;
    report(&mut graph, "released", &[gate], &tx)?;
    let handle: GraphHandle = executor.submit(graph)?;

    counter.0.store(1, Ordering::Release);
    ensure_eq!(rx.recv_timeout(Duration::from_millis(50)).is_err(), true);
    ensure_eq!(handle.is_complete(), false);

    counter.0.store(2, Ordering::Release);
    ensure_eq!(rx.recv_timeout(TIMEOUT)?, "released");
    handle.wait(Deadline::from_timeout(TIMEOUT))?;
    Ok(())
}

/// Tests that a wait task whose deadline expires fails its graph.
#[test]
fn wait_task_times_out() -> Result<()> {
    let executor: Executor = executor(1)?;
    let mut graph: TaskGraph = TaskGraph::new("late");
    graph.wait(
        "never",
        &[],
        Arc::new(Counter::default()),
        1,
        Deadline::from_timeout(Duration::from_millis(10)),
    )?;
    match executor.submit(graph)?.wait(Deadline::from_timeout(TIMEOUT)) {
        Err(e) => ensure_eq!(e.is_deadline_exceeded(), true),
        Ok(()) => anyhow::bail!("wait task should time out"),
    }
    Ok(())
}

/// Tests that cancelling a running graph skips the tasks that have not started.
#[test]
fn cancel_skips_unstarted_tasks() -> Result<()> {
    let executor: Executor = executor(2)?;
    let (started_tx, started_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
    let (release_tx, release_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();

    let mut graph: TaskGraph = TaskGraph::new("cancelled");
    let first: TaskId = graph.call("first", &[], move |_| {
        started_tx
            .send(())
            .map_err(|_| Fail::new(libc::EIO, "start channel closed"))?;
        release_rx
            .recv()
            .map_err(|_| Fail::new(libc::EIO, "release channel closed"))
    })?;
    let second: TaskId = report(&mut graph, "second", &[first], &tx)?;
    report(&mut graph, "third", &[second], &tx)?;
    drop(tx);

    let handle: GraphHandle = executor.submit(graph)?;
    started_rx.recv_timeout(TIMEOUT)?;
    handle.cancel();
    release_tx.send(())?;

    match handle.wait(Deadline::from_timeout(TIMEOUT)) {
        Err(e) => ensure_eq!(e.is_cancelled(), true),
        Ok(()) => anyhow::bail!("cancelled graph should report cancellation"),
    }
    ensure_eq!(rx.iter().count(), 0);
    ensure_eq!(
        handle.counters(),
        ScopeCounters {
            completed: 1,
            failed: 0,
            aborted: 2,
            pending: 0,
        }
    );
    executor.wait_idle(Deadline::from_timeout(TIMEOUT))?;
    ensure_eq!(executor.outstanding_tasks(), 0);
    Ok(())
}

/// Tests that shutting down with a parked wait task aborts it along with its dependents.
#[test]
fn shutdown_discards_parked_work() -> Result<()> {
    let executor: Executor = executor(1)?;
    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = crossbeam_channel::unbounded();
    let mut graph: TaskGraph = TaskGraph::new("stranded");
    let gate: TaskId = graph.wait(
        "gate",
        &[],
        Arc::new(Counter::default()),
        1,
        Deadline::InfiniteFuture,
    )?;
    report(&mut graph, "released", &[gate], &tx)?;
    drop(tx);

    let handle: GraphHandle = executor.submit(graph)?;
    ensure_eq!(handle.is_complete(), false);
    executor.shutdown()?;

    match handle.status() {
        Some(Err(e)) => ensure_eq!(e.is_cancelled(), true),
        other => anyhow::bail!("unexpected status after shutdown: {:?}", other),
    }
    ensure_eq!(rx.iter().count(), 0);
    ensure_eq!(
        handle.counters(),
        ScopeCounters {
            completed: 0,
            failed: 0,
            aborted: 2,
            pending: 0,
        }
    );
    ensure_eq!(executor.outstanding_tasks(), 0);
    Ok(())
}

/// Tests that the executor refuses work once shut down.
#[test]
fn shutdown_refuses_submissions() -> Result<()> {
    let executor: Executor = executor(2)?;
    executor.shutdown()?;
    executor.shutdown()?;
    match executor.submit(TaskGraph::new("late")) {
        Err(e) => ensure_eq!(e.is_cancelled(), true),
        Ok(_) => anyhow::bail!("submission after shutdown should fail"),
    }
    Ok(())
}

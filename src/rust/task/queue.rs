// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::collections::{
        AtomicSlist,
        FlushOrder,
        TaskList,
    },
    task::task::Task,
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Ready queue owned by one worker.
///
/// The owner pops from the front. Thieves take batches from the back. Every operation holds the queue lock, so a task
/// is dequeued at most once.
pub struct TaskQueue {
    list: Mutex<TaskList<Task>>,
    /// Length as of the last operation. Read without the lock to pick steal victims.
    depth: AtomicUsize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(TaskList::new()),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Approximate number of queued tasks.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn push_front(&self, task: Arc<Task>) {
        let mut list: MutexGuard<TaskList<Task>> = self.list.lock();
        list.push_front(task);
        self.depth.store(list.len(), Ordering::Relaxed);
    }

    /// Appends a batch that was built as a stack, most recent first. The batch is reversed before taking the lock.
    pub fn append_from_lifo_list(&self, batch: &mut TaskList<Task>) {
        if batch.is_empty() {
            return;
        }
        batch.reverse();
        let mut list: MutexGuard<TaskList<Task>> = self.list.lock();
        list.append(batch);
        self.depth.store(list.len(), Ordering::Relaxed);
    }

    /// Moves everything submitted to `incoming` onto this queue in submission order and pops the next task to run.
    pub fn flush_from_lifo_slist(&self, incoming: &AtomicSlist<Task>) -> Option<Arc<Task>> {
        let mut batch: TaskList<Task> = incoming.flush(FlushOrder::ApproximateFifo);
        let mut list: MutexGuard<TaskList<Task>> = self.list.lock();
        list.append(&mut batch);
        let task: Option<Arc<Task>> = list.pop_front();
        self.depth.store(list.len(), Ordering::Relaxed);
        task
    }

    pub fn pop_front(&self) -> Option<Arc<Task>> {
        let mut list: MutexGuard<TaskList<Task>> = self.list.lock();
        let task: Option<Arc<Task>> = list.pop_front();
        self.depth.store(list.len(), Ordering::Relaxed);
        task
    }

    /// Steals up to `max_count` tasks from the back of this queue on behalf of `target`. One stolen task is returned
    /// for immediate execution and the rest land on `target`. Returns `None` if there was nothing to steal or if
    /// `target` is this queue.
    pub fn try_steal(&self, target: &TaskQueue, max_count: usize) -> Option<Arc<Task>> {
        if ::std::ptr::eq(self, target) || max_count == 0 {
            return None;
        }

        let mut stolen: TaskList<Task> = TaskList::new();
        {
            let mut victim: MutexGuard<TaskList<Task>> = self.list.lock();
            victim.split(max_count, &mut stolen);
            self.depth.store(victim.len(), Ordering::Relaxed);
        }

        // Run the oldest of the stolen tasks now.
        let task: Option<Arc<Task>> = stolen.pop_front();
        if !stolen.is_empty() {
            let mut list: MutexGuard<TaskList<Task>> = target.list.lock();
            list.append(&mut stolen);
            target.depth.store(list.len(), Ordering::Relaxed);
        }
        task
    }

    /// Takes every queued task. Used at teardown.
    pub fn take_all(&self) -> TaskList<Task> {
        let mut taken: TaskList<Task> = TaskList::new();
        let mut list: MutexGuard<TaskList<Task>> = self.list.lock();
        taken.append(&mut list);
        self.depth.store(0, Ordering::Relaxed);
        taken
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

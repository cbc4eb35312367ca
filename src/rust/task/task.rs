// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        collections::IntrusivelyLinked,
        fail::Fail,
        time::Deadline,
    },
    task::scope::Scope,
};
use ::parking_lot::Mutex;
use ::std::{
    fmt,
    mem,
    ops::Range,
    ptr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicPtr,
            AtomicU32,
            AtomicU8,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Body of a call task.
pub type CallFn = Box<dyn FnOnce(&TaskContext) -> Result<(), Fail> + Send>;

/// Kernel run once per workgroup of a dispatch.
pub type DispatchFn = Arc<dyn Fn(&TaskContext, WorkgroupId) -> Result<(), Fail> + Send + Sync>;

/// Coordinates of one workgroup within a dispatch grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkgroupId {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Information handed to a running task.
#[derive(Clone, Copy, Debug)]
pub struct TaskContext {
    /// Ordinal of the worker running the task.
    pub worker_ordinal: usize,
    /// Number of workers in the executor.
    pub worker_count: usize,
}

/// What a task does when it runs.
pub enum TaskKind {
    /// Runs a host closure.
    Call(CallFn),
    /// Does nothing. Joins its predecessors and releases its dependents.
    Barrier,
    /// Completes once `source` reaches `value`, or fails once `deadline` passes.
    Wait {
        source: Arc<dyn WaitSource>,
        value: u64,
        deadline: Deadline,
    },
    /// Fans out into slices of at most `slice_size` workgroups that run across workers.
    Dispatch {
        workgroup_count: [u32; 3],
        slice_size: u32,
        kernel: DispatchFn,
    },
    /// A range of linear workgroup indices of a dispatch.
    DispatchSlice {
        workgroup_count: [u32; 3],
        workgroups: Range<u64>,
        kernel: DispatchFn,
    },
}

/// Lifecycle of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Waiting on predecessors.
    Pending = 0,
    /// Queued for execution.
    Ready = 1,
    /// Running on a worker, or parked waiting on a semaphore.
    Executing = 2,
    /// Finished successfully.
    Completed = 3,
    /// Finished with an error.
    Failed = 4,
    /// Skipped because a predecessor failed or the graph was cancelled.
    Aborted = 5,
}

/// Schedulable unit of work. A node of a task graph.
pub struct Task {
    /// Intrusive link used by task lists and submission slists.
    next: AtomicPtr<Task>,
    /// Task name, for diagnostics.
    name: String,
    /// Work to do. Taken when the task runs.
    kind: Mutex<Option<TaskKind>>,
    /// Number of predecessors that have not completed yet.
    pending_dependencies: AtomicU32,
    /// Tasks waiting on this one. Taken when this task completes.
    dependents: Mutex<Vec<Arc<Task>>>,
    /// Worker this task must run on, if any.
    affinity: Option<usize>,
    /// Set when a predecessor did not complete successfully.
    aborted: AtomicBool,
    /// Current [TaskStatus].
    status: AtomicU8,
    /// Result sink of the graph this task belongs to.
    scope: Arc<Scope>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// A monotonically increasing payload that wait tasks poll without blocking.
pub trait WaitSource: Send + Sync {
    /// Returns true once the payload has reached `value`. Fails if the source itself failed.
    fn is_reached(&self, value: u64) -> Result<bool, Fail>;
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkgroupId {
    /// Converts a linear workgroup index into grid coordinates, with `x` varying fastest.
    pub fn from_linear(index: u64, workgroup_count: [u32; 3]) -> Self {
        let x_count: u64 = workgroup_count[0] as u64;
        let y_count: u64 = workgroup_count[1] as u64;
        WorkgroupId {
            x: (index % x_count) as u32,
            y: ((index / x_count) % y_count) as u32,
            z: (index / (x_count * y_count)) as u32,
        }
    }
}

impl Task {
    pub(crate) fn new(
        name: String,
        kind: TaskKind,
        pending_dependencies: u32,
        dependents: Vec<Arc<Task>>,
        affinity: Option<usize>,
        scope: Arc<Scope>,
    ) -> Arc<Self> {
        let status: TaskStatus = if pending_dependencies == 0 {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        Arc::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            name,
            kind: Mutex::new(Some(kind)),
            pending_dependencies: AtomicU32::new(pending_dependencies),
            dependents: Mutex::new(dependents),
            affinity,
            aborted: AtomicBool::new(false),
            status: AtomicU8::new(status as u8),
            scope,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn pending_dependencies(&self) -> u32 {
        self.pending_dependencies.load(Ordering::Acquire)
    }

    /// Resolves one predecessor. Returns true if that was the last one and the task is now ready.
    pub(crate) fn release_dependency(&self) -> bool {
        let previous: u32 = self.pending_dependencies.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "task {} released more times than it has predecessors", self.name);
        if previous == 1 {
            self.set_status(TaskStatus::Ready);
            true
        } else {
            false
        }
    }

    /// Marks this task so that it is skipped when it runs.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn take_kind(&self) -> Option<TaskKind> {
        self.kind.lock().take()
    }

    pub(crate) fn take_dependents(&self) -> Vec<Arc<Task>> {
        mem::take(&mut *self.dependents.lock())
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl IntrusivelyLinked for Task {
    fn get_next(&self) -> *mut Self {
        self.next.load(Ordering::Relaxed)
    }

    fn set_next(&self, next: *mut Self) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl From<u8> for TaskStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Ready,
            2 => TaskStatus::Executing,
            3 => TaskStatus::Completed,
            4 => TaskStatus::Failed,
            _ => TaskStatus::Aborted,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("pending_dependencies", &self.pending_dependencies())
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Call(_) => write!(f, "Call"),
            TaskKind::Barrier => write!(f, "Barrier"),
            TaskKind::Wait { value, deadline, .. } => write!(f, "Wait({}, {:?})", value, deadline),
            TaskKind::Dispatch { workgroup_count, .. } => write!(f, "Dispatch({:?})", workgroup_count),
            TaskKind::DispatchSlice { workgroups, .. } => write!(f, "DispatchSlice({:?})", workgroups),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

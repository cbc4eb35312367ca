// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        collections::TaskList,
        fail::Fail,
        time::Deadline,
    },
    task::{
        scope::{
            CompletionFn,
            Scope,
            ScopeCounters,
        },
        task::{
            DispatchFn,
            Task,
            TaskContext,
            TaskKind,
            WaitSource,
            WorkgroupId,
        },
    },
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Index of a task within a [TaskGraph].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

struct Node {
    name: String,
    kind: TaskKind,
    dependencies: Vec<usize>,
    affinity: Option<usize>,
}

/// Builder for a directed acyclic graph of tasks.
///
/// A task may only depend on tasks added before it, so every graph built here is acyclic by construction.
pub struct TaskGraph {
    name: String,
    nodes: Vec<Node>,
    on_complete: Option<CompletionFn>,
}

/// Tasks of a graph, linked and ready to be handed to workers.
pub(crate) struct Instance {
    pub scope: Arc<Scope>,
    /// Tasks with no predecessors, in insertion order.
    pub roots: TaskList<Task>,
    pub task_count: usize,
}

/// Observes and controls a submitted graph.
#[derive(Clone, Debug)]
pub struct GraphHandle {
    scope: Arc<Scope>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl TaskGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
            on_complete: None,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a task that runs after every task in `dependencies` completed.
    pub fn add(&mut self, name: &str, kind: TaskKind, dependencies: &[TaskId]) -> Result<TaskId, Fail> {
        let index: usize = self.nodes.len();
        let mut resolved: Vec<usize> = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            if dependency.0 >= index {
                let cause: String = format!(
                    "task {} of graph {} depends on unknown task {}",
                    name, self.name, dependency.0
                );
                error!("add(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
            if !resolved.contains(&dependency.0) {
                resolved.push(dependency.0);
            }
        }
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            dependencies: resolved,
            affinity: None,
        });
        Ok(TaskId(index))
    }

    /// Adds a task that runs `f` on some worker.
    pub fn call<F>(&mut self, name: &str, dependencies: &[TaskId], f: F) -> Result<TaskId, Fail>
    where
        F: FnOnce(&TaskContext) -> Result<(), Fail> + Send + 'static,
    {
        self.add(name, TaskKind::Call(Box::new(f)), dependencies)
    }

    /// Adds a task that only joins `dependencies`.
    pub fn barrier(&mut self, name: &str, dependencies: &[TaskId]) -> Result<TaskId, Fail> {
        self.add(name, TaskKind::Barrier, dependencies)
    }

    /// Adds a task that completes once `source` reaches `value`, without blocking a worker.
    pub fn wait(
        &mut self,
        name: &str,
        dependencies: &[TaskId],
        source: Arc<dyn WaitSource>,
        value: u64,
        deadline: Deadline,
    ) -> Result<TaskId, Fail> {
        self.add(
            name,
            TaskKind::Wait {
                source,
                value,
                deadline,
            },
            dependencies,
        )
    }

    /// Adds a task that runs `kernel` once per workgroup of a `workgroup_count` grid. Workgroups are split into
    /// slices of at most `slice_size` that execute concurrently.
    pub fn dispatch<F>(
        &mut self,
        name: &str,
        dependencies: &[TaskId],
        workgroup_count: [u32; 3],
        slice_size: u32,
        kernel: F,
    ) -> Result<TaskId, Fail>
    where
        F: Fn(&TaskContext, WorkgroupId) -> Result<(), Fail> + Send + Sync + 'static,
    {
        if slice_size == 0 {
            let cause: String = format!("dispatch {} of graph {} has an empty slice size", name, self.name);
            error!("dispatch(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let kernel: DispatchFn = Arc::new(kernel);
        self.add(
            name,
            TaskKind::Dispatch {
                workgroup_count,
                slice_size,
                kernel,
            },
            dependencies,
        )
    }

    /// Requires `task` to run on worker `worker`. Checked against the executor at submission.
    pub fn pin(&mut self, task: TaskId, worker: usize) -> Result<(), Fail> {
        match self.nodes.get_mut(task.0) {
            Some(node) => {
                node.affinity = Some(worker);
                Ok(())
            },
            None => {
                let cause: String = format!("graph {} has no task {}", self.name, task.0);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// Registers a callback invoked once with the final status of the graph.
    pub fn on_complete<F>(&mut self, f: F)
    where
        F: FnOnce(Result<(), Fail>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
    }

    /// Links the tasks of this graph for a pool of `worker_count` workers.
    pub(crate) fn instantiate(self, worker_count: usize) -> Result<Instance, Fail> {
        for node in &self.nodes {
            if let Some(worker) = node.affinity {
                if worker >= worker_count {
                    let cause: String = format!(
                        "task {} of graph {} is pinned to worker {} but there are only {} workers",
                        node.name, self.name, worker, worker_count
                    );
                    error!("instantiate(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                }
            }
        }

        let task_count: usize = self.nodes.len();
        let scope: Arc<Scope> = Scope::new(self.name, self.on_complete);
        scope.add_pending(task_count);

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); task_count];
        for (index, node) in self.nodes.iter().enumerate() {
            for dependency in &node.dependencies {
                dependents[*dependency].push(index);
            }
        }

        // Dependents always come later, so building back to front links every task to already built successors.
        let mut tasks: Vec<Option<Arc<Task>>> = vec![None; task_count];
        for (index, node) in self.nodes.into_iter().enumerate().rev() {
            let successors: Vec<Arc<Task>> = dependents[index]
                .iter()
                .filter_map(|successor| tasks[*successor].clone())
                .collect();
            tasks[index] = Some(Task::new(
                node.name,
                node.kind,
                node.dependencies.len() as u32,
                successors,
                node.affinity,
                scope.clone(),
            ));
        }

        let mut roots: TaskList<Task> = TaskList::new();
        for task in tasks.into_iter().flatten() {
            if task.pending_dependencies() == 0 {
                roots.push_back(task);
            }
        }

        if task_count == 0 {
            scope.finish();
        }

        Ok(Instance {
            scope,
            roots,
            task_count,
        })
    }
}

impl GraphHandle {
    pub(crate) fn new(scope: Arc<Scope>) -> Self {
        Self { scope }
    }

    pub fn get_name(&self) -> &str {
        self.scope.get_name()
    }

    pub fn is_complete(&self) -> bool {
        self.scope.is_complete()
    }

    /// Final status of the graph, or `None` while it is still running.
    pub fn status(&self) -> Option<Result<(), Fail>> {
        self.scope.status()
    }

    /// Blocks until the graph completes or `deadline` expires.
    pub fn wait(&self, deadline: Deadline) -> Result<(), Fail> {
        self.scope.wait(deadline)
    }

    /// Skips every task of the graph that has not started yet.
    pub fn cancel(&self) {
        self.scope.cancel()
    }

    pub fn counters(&self) -> ScopeCounters {
        self.scope.counters()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

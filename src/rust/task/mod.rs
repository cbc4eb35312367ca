// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod executor;
pub mod graph;
pub mod queue;
pub mod scope;
pub mod task;
pub mod worker;

pub use self::{
    executor::Executor,
    graph::{
        GraphHandle,
        TaskGraph,
        TaskId,
    },
    scope::ScopeCounters,
    task::{
        TaskContext,
        TaskKind,
        TaskStatus,
        WaitSource,
        WorkgroupId,
    },
    worker::WorkerState,
};

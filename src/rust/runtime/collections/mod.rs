// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod atomic_slist;
pub mod task_list;

pub use self::{
    atomic_slist::{
        AtomicSlist,
        FlushOrder,
    },
    task_list::{
        IntrusivelyLinked,
        TaskList,
    },
};

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod fence;
pub mod semaphore;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    fence::{
        TimePointFence,
        TimePointFencePool,
    },
    semaphore::{
        TimePointSemaphore,
        TimePointSemaphorePool,
        UNUSED_VALUE,
    },
};

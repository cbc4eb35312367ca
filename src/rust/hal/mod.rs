// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod backend;
pub mod command_buffer;
pub mod device;
pub mod event;
pub mod semaphore;
pub mod timepoint;

pub use self::{
    backend::{
        DeviceBackend,
        FenceHandle,
        FenceStatus,
        HostBackend,
    },
    command_buffer::{
        CommandBuffer,
        CommandBufferState,
    },
    device::{
        Device,
        SemaphoreList,
        SubmissionBatch,
    },
    event::Event,
    semaphore::{
        wait_semaphores,
        TimelineSemaphore,
        WaitMode,
    },
};

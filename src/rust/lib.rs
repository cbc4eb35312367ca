// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod hal;
pub mod runtime;
pub mod task;

pub use self::{
    hal::{
        CommandBuffer,
        Device,
        DeviceBackend,
        Event,
        HostBackend,
        SemaphoreList,
        SubmissionBatch,
        TimelineSemaphore,
        WaitMode,
    },
    runtime::{
        config::Config,
        fail::Fail,
        options::{
            DeviceOptions,
            ExecutorOptions,
        },
        time::Deadline,
    },
    task::{
        Executor,
        GraphHandle,
        TaskGraph,
        TaskId,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equivalent or returns an Error.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(r#"ensure failed: `(left == right)`
    left: `{:?}`,
   right: `{:?}`"#, left_val, right_val)
                }
            }
        }
    });
    ($left:expr, $right:expr, $($arg:tt)+) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(r#"ensure failed: `(left == right)`
    left: `{:?}`,
   right: `{:?}`: {}"#, left_val, right_val, format_args!($($arg)+))
                }
            }
        }
    });
}

/// Ensures that two expressions are not equivalent or returns an Error.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(r#"ensure failed: `(left != right)`
    left: `{:?}`,
   right: `{:?}`"#, left_val, right_val)
                }
            }
        }
    });
    ($left:expr, $right:expr, $($arg:tt)+) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(r#"ensure failed: `(left != right)`
    left: `{:?}`,
   right: `{:?}`: {}"#, left_val, right_val, format_args!($($arg)+))
                }
            }
        }
    });
}

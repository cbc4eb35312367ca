// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod collections;
pub mod config;
pub mod fail;
pub mod logging;
pub mod options;
pub mod time;

pub use self::{
    fail::Fail,
    time::Deadline,
};

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::time::{
    Duration,
    Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Absolute point in time after which a blocking operation gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Poll once and never block.
    Immediate,
    /// Give up at the given instant.
    At(Instant),
    /// Never give up.
    InfiniteFuture,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Deadline {
    /// Converts a relative timeout into an absolute deadline. Timeouts too large to be represented are treated as
    /// infinite.
    pub fn from_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Deadline::Immediate;
        }
        match Instant::now().checked_add(timeout) {
            Some(instant) => Deadline::At(instant),
            None => Deadline::InfiniteFuture,
        }
    }

    /// Returns true if the deadline has passed.
    pub fn has_expired(&self) -> bool {
        match self {
            Deadline::Immediate => true,
            Deadline::At(instant) => Instant::now() >= *instant,
            Deadline::InfiniteFuture => false,
        }
    }

    /// Time remaining until the deadline, or `None` if it never expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::Immediate => Some(Duration::ZERO),
            Deadline::At(instant) => Some(instant.saturating_duration_since(Instant::now())),
            Deadline::InfiniteFuture => None,
        }
    }

    /// Returns how long a blocked thread should sleep before re-checking its condition: the time remaining, capped at
    /// `interval`.
    pub fn next_wakeup(&self, interval: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(interval),
            None => interval,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

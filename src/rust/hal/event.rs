// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Queue-local synchronization point set and cleared by command buffers.
#[derive(Clone, Debug, Default)]
pub struct Event {
    signaled: Arc<AtomicBool>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Event;
    use ::anyhow::Result;

    #[test]
    fn clones_share_state() -> Result<()> {
        let event: Event = Event::new();
        let alias: Event = event.clone();
        crate::ensure_eq!(event.is_signaled(), false);
        alias.signal();
        crate::ensure_eq!(event.is_signaled(), true);
        event.reset();
        crate::ensure_eq!(alias.is_signaled(), false);
        Ok(())
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::runtime::{
    config::Config,
    fail::Fail,
};
use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default number of tasks moved by a single steal.
pub const DEFAULT_STEAL_BATCH_SIZE: usize = 8;

/// Default park timeout for idle workers. Bounds the latency of wait-task polling.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_micros(500);

/// Default capacity of the timepoint fence pool.
pub const DEFAULT_MAX_IN_FLIGHT_FENCES: usize = 64;

/// Default capacity of the timepoint semaphore pool.
pub const DEFAULT_MAX_IN_FLIGHT_SEMAPHORES: usize = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub worker_count: usize,
    pub steal_batch_size: usize,
    pub idle_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct DeviceOptions {
    pub queue_count: usize,
    pub max_in_flight_fences: usize,
    pub max_in_flight_semaphores: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecutorOptions {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            worker_count: config.worker_count()?,
            steal_batch_size: config.steal_batch_size()?,
            idle_timeout: config.idle_timeout()?,
        })
    }

    pub fn worker_count(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.worker_count = value;
        self
    }

    pub fn steal_batch_size(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.steal_batch_size = value;
        self
    }

    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }
}

impl DeviceOptions {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            queue_count: config.queue_count()?,
            max_in_flight_fences: config.max_in_flight_fences()?,
            max_in_flight_semaphores: config.max_in_flight_semaphores()?,
        })
    }

    pub fn queue_count(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.queue_count = value;
        self
    }

    pub fn max_in_flight_fences(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.max_in_flight_fences = value;
        self
    }

    pub fn max_in_flight_semaphores(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.max_in_flight_semaphores = value;
        self
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ExecutorOptions {
    fn default() -> Self {
        let worker_count: usize = ::std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ExecutorOptions {
            worker_count,
            steal_batch_size: DEFAULT_STEAL_BATCH_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            queue_count: 1,
            max_in_flight_fences: DEFAULT_MAX_IN_FLIGHT_FENCES,
            max_in_flight_semaphores: DEFAULT_MAX_IN_FLIGHT_SEMAPHORES,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        DeviceOptions,
        ExecutorOptions,
    };
    use crate::runtime::config::Config;
    use ::anyhow::Result;

    #[test]
    fn options_from_config() -> Result<()> {
        let config: Config = "executor:\n  worker_count: 2\n  steal_batch_size: 4\n  idle_timeout_us: 10\n\
                              device:\n  queue_count: 1\n  max_in_flight_fences: 8\n  max_in_flight_semaphores: 9\n"
            .parse()?;
        let executor: ExecutorOptions = ExecutorOptions::from_config(&config)?;
        let device: DeviceOptions = DeviceOptions::from_config(&config)?;
        crate::ensure_eq!(executor.worker_count, 2);
        crate::ensure_eq!(executor.steal_batch_size, 4);
        crate::ensure_eq!(device.max_in_flight_fences, 8);
        crate::ensure_eq!(device.max_in_flight_semaphores, 9);
        Ok(())
    }

    #[test]
    fn default_has_workers() -> Result<()> {
        let options: ExecutorOptions = ExecutorOptions::default().steal_batch_size(2);
        anyhow::ensure!(options.worker_count >= 1);
        crate::ensure_eq!(options.steal_batch_size, 2);
        Ok(())
    }
}

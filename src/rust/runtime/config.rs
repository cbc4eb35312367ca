// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Executor options. These apply to the worker pool.
mod executor_config {
    pub const SECTION_NAME: &str = "executor";
    // Number of worker threads.
    pub const WORKER_COUNT: &str = "worker_count";
    // Maximum number of tasks moved by a single steal.
    pub const STEAL_BATCH_SIZE: &str = "steal_batch_size";
    // How long an idle worker parks before checking for work again.
    pub const IDLE_TIMEOUT_US: &str = "idle_timeout_us";
}

// Device options. These apply to queue submission and timepoint pools.
mod device_config {
    pub const SECTION_NAME: &str = "device";
    pub const QUEUE_COUNT: &str = "queue_count";
    pub const MAX_IN_FLIGHT_FENCES: &str = "max_in_flight_fences";
    pub const MAX_IN_FLIGHT_SEMAPHORES: &str = "max_in_flight_semaphores";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Common associated functions for the runtime configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: String) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(&config_path)?.read_to_string(&mut config_s)?;
        config_s.parse()
    }

    fn get_executor_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, executor_config::SECTION_NAME)
    }

    fn get_device_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, device_config::SECTION_NAME)
    }

    /// Executor config: Reads the number of worker threads from the environment variable first and then the
    /// underlying configuration file.
    pub fn worker_count(&self) -> Result<usize, Fail> {
        let count: usize = if let Some(count) = Self::get_typed_env_option(executor_config::WORKER_COUNT)? {
            count
        } else {
            Self::get_int_option(self.get_executor_config()?, executor_config::WORKER_COUNT)?
        };
        Self::require_nonzero(executor_config::WORKER_COUNT, count)
    }

    /// Executor config: Reads the maximum number of tasks moved by one steal.
    pub fn steal_batch_size(&self) -> Result<usize, Fail> {
        let size: usize = if let Some(size) = Self::get_typed_env_option(executor_config::STEAL_BATCH_SIZE)? {
            size
        } else {
            Self::get_int_option(self.get_executor_config()?, executor_config::STEAL_BATCH_SIZE)?
        };
        Self::require_nonzero(executor_config::STEAL_BATCH_SIZE, size)
    }

    /// Executor config: Reads how long an idle worker parks before looking for work again.
    pub fn idle_timeout(&self) -> Result<Duration, Fail> {
        let timeout: u64 = if let Some(timeout) = Self::get_typed_env_option(executor_config::IDLE_TIMEOUT_US)? {
            timeout
        } else {
            Self::get_int_option(self.get_executor_config()?, executor_config::IDLE_TIMEOUT_US)?
        };
        Ok(Duration::from_micros(timeout))
    }

    /// Device config: Reads the number of submission queues exposed by a device.
    pub fn queue_count(&self) -> Result<usize, Fail> {
        let count: usize = if let Some(count) = Self::get_typed_env_option(device_config::QUEUE_COUNT)? {
            count
        } else {
            Self::get_int_option(self.get_device_config()?, device_config::QUEUE_COUNT)?
        };
        Self::require_nonzero(device_config::QUEUE_COUNT, count)
    }

    /// Device config: Reads the capacity of the timepoint fence pool.
    pub fn max_in_flight_fences(&self) -> Result<usize, Fail> {
        let count: usize = if let Some(count) = Self::get_typed_env_option(device_config::MAX_IN_FLIGHT_FENCES)? {
            count
        } else {
            Self::get_int_option(self.get_device_config()?, device_config::MAX_IN_FLIGHT_FENCES)?
        };
        Self::require_nonzero(device_config::MAX_IN_FLIGHT_FENCES, count)
    }

    /// Device config: Reads the capacity of the timepoint semaphore pool.
    pub fn max_in_flight_semaphores(&self) -> Result<usize, Fail> {
        let count: usize = if let Some(count) = Self::get_typed_env_option(device_config::MAX_IN_FLIGHT_SEMAPHORES)? {
            count
        } else {
            Self::get_int_option(self.get_device_config()?, device_config::MAX_IN_FLIGHT_SEMAPHORES)?
        };
        Self::require_nonzero(device_config::MAX_IN_FLIGHT_SEMAPHORES, count)
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    fn require_nonzero(index: &str, value: usize) -> Result<usize, Fail> {
        if value == 0 {
            let cause: String = format!("parameter \"{}\" must be greater than zero", index);
            error!("require_nonzero(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(value)
    }

    /// Similar to `require_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `require_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl FromStr for Config {
    type Err = Fail;

    /// Parses a YAML document into a [Config] object.
    fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {:?}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use ::anyhow::Result;
    use ::std::time::Duration;

    const CONFIG: &str = r#"
executor:
  worker_count: 3
  steal_batch_size: 16
  idle_timeout_us: 250
device:
  queue_count: 2
  max_in_flight_fences: 32
  max_in_flight_semaphores: 48
"#;

    #[test]
    fn reads_all_sections() -> Result<()> {
        let config: Config = CONFIG.parse()?;
        crate::ensure_eq!(config.worker_count()?, 3);
        crate::ensure_eq!(config.steal_batch_size()?, 16);
        crate::ensure_eq!(config.idle_timeout()?, Duration::from_micros(250));
        crate::ensure_eq!(config.queue_count()?, 2);
        crate::ensure_eq!(config.max_in_flight_fences()?, 32);
        crate::ensure_eq!(config.max_in_flight_semaphores()?, 48);
        Ok(())
    }

    #[test]
    fn rejects_missing_section() -> Result<()> {
        let config: Config = "executor:\n  worker_count: 1\n".parse()?;
        match config.max_in_flight_semaphores() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(_) => anyhow::bail!("missing device section should fail"),
        }
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_values() -> Result<()> {
        let config: Config = "device:\n  max_in_flight_fences: -4\n  queue_count: 0\n".parse()?;
        match config.max_in_flight_fences() {
            Err(e) => crate::ensure_eq!(e.errno, libc::ERANGE),
            Ok(_) => anyhow::bail!("negative capacity should fail"),
        }
        match config.queue_count() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(_) => anyhow::bail!("zero queues should fail"),
        }
        Ok(())
    }

    #[test]
    fn rejects_multiple_documents() -> Result<()> {
        match "a: 1\n---\nb: 2\n".parse::<Config>() {
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
            Ok(_) => anyhow::bail!("two documents should fail"),
        }
        Ok(())
    }
}

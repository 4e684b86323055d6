//! Engine configuration
//!
//! Every section deserializes from TOML with defaults for missing keys:
//!
//! ```toml
//! [coro_pool]
//! initial_size = 8
//! max_size = 512
//!
//! [task_processor]
//! name = "main-task-processor"
//! worker_threads = 4
//! task_queue = "work-stealing-task-queue"
//!
//! [settings]
//! wait_queue_length_limit = 10000
//! overload_action = "cancel"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Coroutine pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoroutinePoolConfig {
    /// Coroutines allocated up front
    pub initial_size: usize,
    /// Maximum number of idle coroutines kept for reuse
    pub max_size: usize,
    /// Stack size of each coroutine in bytes
    pub stack_size: usize,
    /// Per-worker cache of idle coroutines
    pub local_cache_size: usize,
}

impl Default for CoroutinePoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 8,
            max_size: 1024,
            stack_size: 256 * 1024,
            local_cache_size: 8,
        }
    }
}

impl CoroutinePoolConfig {
    /// Minimal stack size accepted for a coroutine
    pub const MIN_STACK_SIZE: usize = 64 * 1024;

    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "coro_pool.max_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.initial_size > self.max_size {
            return Err(ConfigError::Invalid {
                field: "coro_pool.initial_size",
                reason: format!("{} exceeds max_size {}", self.initial_size, self.max_size),
            });
        }
        if self.stack_size < Self::MIN_STACK_SIZE {
            return Err(ConfigError::Invalid {
                field: "coro_pool.stack_size",
                reason: format!("must be at least {} bytes", Self::MIN_STACK_SIZE),
            });
        }
        Ok(())
    }
}

/// Which task queue implementation a processor uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskQueueType {
    /// Single shared queue for all workers
    GlobalTaskQueue,
    /// Per-worker local queues with stealing plus a shared global queue
    #[default]
    WorkStealingTaskQueue,
}

/// Static task processor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProcessorConfig {
    /// Processor name, used in logs and stats
    pub name: String,
    /// Number of worker threads (0 = number of CPUs)
    pub worker_threads: usize,
    /// Prefix of worker thread names
    pub thread_name: String,
    /// Task queue implementation
    pub task_queue: TaskQueueType,
    /// Empty polls a worker performs before going to sleep
    pub spinning_iterations: usize,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            name: "main-task-processor".to_string(),
            worker_threads: 0,
            thread_name: "weaver-worker".to_string(),
            task_queue: TaskQueueType::default(),
            spinning_iterations: 64,
        }
    }
}

impl TaskProcessorConfig {
    /// Config with a specific number of workers
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Default::default()
        }
    }

    /// Effective number of worker threads
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    /// Validate the processor configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "task_processor.name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.worker_threads > 4096 {
            return Err(ConfigError::Invalid {
                field: "task_processor.worker_threads",
                reason: format!("{} is too many", self.worker_threads),
            });
        }
        Ok(())
    }
}

/// Reaction to an overloaded processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverloadAction {
    /// Only account the overload
    #[default]
    Ignore,
    /// Cancel non-critical tasks with reason Overload
    Cancel,
}

/// Runtime-adjustable processor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProcessorSettings {
    /// Queue length at which newly scheduled tasks count as overload (0 = off)
    pub wait_queue_length_limit: usize,
    /// Queue wait time at which popped tasks count as overload (0 = off)
    pub wait_queue_time_limit_us: u64,
    /// Queue wait time that flips the overload sensor (0 = off)
    pub sensor_wait_queue_time_limit_us: u64,
    /// What to do with tasks that hit an overload limit
    pub overload_action: OverloadAction,
}

impl Default for TaskProcessorSettings {
    fn default() -> Self {
        Self {
            wait_queue_length_limit: 0,
            wait_queue_time_limit_us: 0,
            sensor_wait_queue_time_limit_us: 0,
            overload_action: OverloadAction::Ignore,
        }
    }
}

impl TaskProcessorSettings {
    /// Wait time limit as a duration, `None` when disabled
    pub fn wait_queue_time_limit(&self) -> Option<Duration> {
        (self.wait_queue_time_limit_us > 0)
            .then(|| Duration::from_micros(self.wait_queue_time_limit_us))
    }

    /// Sensor wait time limit as a duration, `None` when disabled
    pub fn sensor_wait_queue_time_limit(&self) -> Option<Duration> {
        (self.sensor_wait_queue_time_limit_us > 0)
            .then(|| Duration::from_micros(self.sensor_wait_queue_time_limit_us))
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Coroutine pool section
    pub coro_pool: CoroutinePoolConfig,
    /// Task processor section
    pub task_processor: TaskProcessorConfig,
    /// Overload settings section
    pub settings: TaskProcessorSettings,
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coro_pool.validate()?;
        self.task_processor.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_processor.task_queue, TaskQueueType::WorkStealingTaskQueue);
        assert_eq!(config.settings.overload_action, OverloadAction::Ignore);
        assert!(config.task_processor.effective_worker_threads() >= 1);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [coro_pool]
            initial_size = 2
            max_size = 16

            [task_processor]
            name = "bg"
            worker_threads = 3
            task_queue = "global-task-queue"

            [settings]
            wait_queue_length_limit = 100
            wait_queue_time_limit_us = 2500
            overload_action = "cancel"
            "#,
        )
        .unwrap();

        assert_eq!(config.coro_pool.initial_size, 2);
        assert_eq!(config.coro_pool.max_size, 16);
        assert_eq!(config.coro_pool.stack_size, 256 * 1024);
        assert_eq!(config.task_processor.name, "bg");
        assert_eq!(config.task_processor.effective_worker_threads(), 3);
        assert_eq!(config.task_processor.task_queue, TaskQueueType::GlobalTaskQueue);
        assert_eq!(config.settings.wait_queue_length_limit, 100);
        assert_eq!(
            config.settings.wait_queue_time_limit(),
            Some(Duration::from_micros(2500))
        );
        assert_eq!(config.settings.sensor_wait_queue_time_limit(), None);
        assert_eq!(config.settings.overload_action, OverloadAction::Cancel);
    }

    #[test]
    fn test_invalid_pool() {
        let err = EngineConfig::from_toml_str("[coro_pool]\ninitial_size = 10\nmax_size = 5\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "coro_pool.initial_size", .. }));
    }

    #[test]
    fn test_small_stack_rejected() {
        let err = EngineConfig::from_toml_str("[coro_pool]\nstack_size = 1024\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "coro_pool.stack_size", .. }));
    }

    #[test]
    fn test_parse_error() {
        let err = EngineConfig::from_toml_str("[task_processor]\nworker_threads = \"many\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

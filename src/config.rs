//! Runtime configuration for the download execution core (§6).
//!
//! Sourcing a [`Config`] from a file or environment is explicitly out of
//! scope for this crate; callers construct one however they like (the
//! enclosing service owns the configuration loader) and pass it to
//! [`crate::scheduler::Scheduler::new`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default layout pattern: `<root>/<author>/<title>/<title>.<format>`.
pub const DEFAULT_LAYOUT_PATTERN: &str = "{author}/{title}/{title}.{format}";

/// Errors returned by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("minWorkers ({min}) must be >= 1")]
    MinWorkersZero { min: usize },

    #[error("maxWorkers ({max}) must be >= minWorkers ({min})")]
    MaxBelowMin { min: usize, max: usize },

    #[error("chunkSizeBytes must be > 0")]
    ZeroChunkSize,

    #[error("memoryCapBytes ({cap}) must be >= chunkSizeBytes ({chunk})")]
    MemoryCapBelowChunk { cap: u64, chunk: u64 },

    #[error("maxAttempts must be >= 1")]
    ZeroMaxAttempts,

    #[error("queueCapacity must be >= 1")]
    ZeroQueueCapacity,

    #[error("layoutPattern must not be empty")]
    EmptyLayoutPattern,
}

/// Recognized configuration options and their effects (§6 table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub max_workers: usize,
    pub min_workers: usize,
    pub adaptive_scaling: bool,
    /// Token-bucket fill rate in bytes/sec; `0` disables the governor.
    pub bandwidth_bytes_per_sec: u64,
    /// Token-bucket capacity in bytes.
    pub bandwidth_bucket_capacity: u64,
    pub memory_cap_bytes: u64,
    pub chunk_size_bytes: usize,
    pub attempt_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
    pub progress_interval: Duration,
    pub queue_capacity: usize,
    pub layout_pattern: String,
    pub auto_organize: bool,
    /// Root directory under which the layout pattern is resolved.
    pub download_root: PathBuf,
    /// Interval at which the adaptive controller re-evaluates worker count.
    pub eval_period: Duration,
    /// Minimum time between successive scaling actions.
    pub scale_cooldown: Duration,
    /// Bounded grace period the broadcaster waits on a slow subscriber
    /// before dropping a terminal event (§9).
    pub terminal_delivery_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_workers: 2,
            adaptive_scaling: true,
            bandwidth_bytes_per_sec: 0,
            bandwidth_bucket_capacity: 4 * 1024 * 1024,
            memory_cap_bytes: 256 * 1024 * 1024,
            chunk_size_bytes: 64 * 1024,
            attempt_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            progress_interval: Duration::from_secs(1),
            queue_capacity: 1000,
            layout_pattern: DEFAULT_LAYOUT_PATTERN.to_string(),
            auto_organize: true,
            download_root: PathBuf::from("./downloads"),
            eval_period: Duration::from_secs(30),
            scale_cooldown: Duration::from_secs(60),
            terminal_delivery_grace: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Validates cross-field invariants not expressible in the type alone.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::MinWorkersZero {
                min: self.min_workers,
            });
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::MaxBelowMin {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.memory_cap_bytes < self.chunk_size_bytes as u64 {
            return Err(ConfigError::MemoryCapBelowChunk {
                cap: self.memory_cap_bytes,
                chunk: self.chunk_size_bytes as u64,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.layout_pattern.trim().is_empty() {
            return Err(ConfigError::EmptyLayoutPattern);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_max_below_min() {
        let mut cfg = Config::default();
        cfg.min_workers = 5;
        cfg.max_workers = 2;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MaxBelowMin { min: 5, max: 2 })
        );
    }

    #[test]
    fn rejects_zero_min_workers() {
        let mut cfg = Config::default();
        cfg.min_workers = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MinWorkersZero { min: 0 })
        );
    }

    #[test]
    fn rejects_memory_cap_below_chunk() {
        let mut cfg = Config::default();
        cfg.chunk_size_bytes = 1024;
        cfg.memory_cap_bytes = 512;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MemoryCapBelowChunk {
                cap: 512,
                chunk: 1024
            })
        );
    }

    #[test]
    fn rejects_empty_layout_pattern() {
        let mut cfg = Config::default();
        cfg.layout_pattern = "   ".to_string();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyLayoutPattern));
    }
}

//! # Configuration
//!
//! Tunables for the runtime and for the plumbing operators. Every field has a
//! default, so a partial JSON document is enough to override a single value:
//!
//! ```rust
//! use edgeflow::config::Config;
//!
//! let config = Config::from_json_str(r#"{ "plumbing": { "parallel_channel_capacity": 32 } }"#)?;
//! assert_eq!(config.plumbing.parallel_channel_capacity, 32);
//! assert_eq!(config.plumbing.barrier_queue_capacity, 10);
//! # Ok::<(), edgeflow::error::ConfigError>(())
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Job and provider settings.
  pub runtime: RuntimeConfig,
  /// Defaults used by the plumbing operators when a topology is built.
  pub plumbing: PlumbingConfig,
}

impl Config {
  /// Parses and validates a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Config = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks that every capacity and interval is usable.
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.runtime.validate()?;
    self.plumbing.validate()
  }
}

/// Settings for submitted jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  /// How often completion waits re-check their condition, in milliseconds.
  pub poll_interval_ms: u64,
  /// How long a stop waits for the job to reach `Closed`, in milliseconds.
  pub close_timeout_ms: u64,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 50,
      close_timeout_ms: 5_000,
    }
  }
}

impl RuntimeConfig {
  /// Sets the completion poll interval.
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval_ms = interval.as_millis() as u64;
    self
  }

  /// Sets the close timeout.
  pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
    self.close_timeout_ms = timeout.as_millis() as u64;
    self
  }

  /// Completion poll interval as a `Duration`.
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  /// Close timeout as a `Duration`.
  pub fn close_timeout(&self) -> Duration {
    Duration::from_millis(self.close_timeout_ms)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.poll_interval_ms == 0 {
      return Err(ConfigError::Invalid {
        field: "runtime.poll_interval_ms",
        reason: "must be at least 1".to_string(),
      });
    }
    Ok(())
  }
}

/// Queue sizes and worker counts used by the plumbing operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlumbingConfig {
  /// Hand-off queue capacity of `isolate` stages.
  pub isolate_queue_capacity: usize,
  /// Number of drain workers of an unordered `isolate` stage.
  pub unordered_isolate_workers: usize,
  /// Per-channel queue capacity of `parallel` and `parallel_map`.
  pub parallel_channel_capacity: usize,
  /// Per-channel queue capacity feeding each `concurrent` channel.
  pub concurrent_channel_capacity: usize,
  /// Results a `concurrent` channel may run ahead of the slowest channel.
  pub barrier_queue_capacity: usize,
  /// Tuples a `parallel_balanced` channel may hold at once.
  pub balanced_channel_depth: usize,
}

impl Default for PlumbingConfig {
  fn default() -> Self {
    Self {
      isolate_queue_capacity: 1024,
      unordered_isolate_workers: 4,
      parallel_channel_capacity: 10,
      concurrent_channel_capacity: 1,
      barrier_queue_capacity: 10,
      balanced_channel_depth: 1,
    }
  }
}

impl PlumbingConfig {
  /// Sets the `isolate` queue capacity.
  pub fn with_isolate_queue_capacity(mut self, capacity: usize) -> Self {
    self.isolate_queue_capacity = capacity;
    self
  }

  /// Sets the number of unordered `isolate` workers.
  pub fn with_unordered_isolate_workers(mut self, workers: usize) -> Self {
    self.unordered_isolate_workers = workers;
    self
  }

  /// Sets the per-channel capacity of `parallel`.
  pub fn with_parallel_channel_capacity(mut self, capacity: usize) -> Self {
    self.parallel_channel_capacity = capacity;
    self
  }

  /// Sets the per-channel capacity of `concurrent`.
  pub fn with_concurrent_channel_capacity(mut self, capacity: usize) -> Self {
    self.concurrent_channel_capacity = capacity;
    self
  }

  /// Sets the barrier queue capacity of `concurrent`.
  pub fn with_barrier_queue_capacity(mut self, capacity: usize) -> Self {
    self.barrier_queue_capacity = capacity;
    self
  }

  /// Sets the per-channel depth of `parallel_balanced`.
  pub fn with_balanced_channel_depth(mut self, depth: usize) -> Self {
    self.balanced_channel_depth = depth;
    self
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let fields = [
      ("plumbing.isolate_queue_capacity", self.isolate_queue_capacity),
      ("plumbing.unordered_isolate_workers", self.unordered_isolate_workers),
      ("plumbing.parallel_channel_capacity", self.parallel_channel_capacity),
      ("plumbing.concurrent_channel_capacity", self.concurrent_channel_capacity),
      ("plumbing.barrier_queue_capacity", self.barrier_queue_capacity),
      ("plumbing.balanced_channel_depth", self.balanced_channel_depth),
    ];
    for (field, value) in fields {
      if value == 0 {
        return Err(ConfigError::Invalid {
          field,
          reason: "must be at least 1".to_string(),
        });
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_yields_defaults() {
    let config = Config::from_json_str("{}").unwrap();
    assert_eq!(config, Config::default());
  }

  #[test]
  fn test_zero_capacity_is_rejected() {
    let err = Config::from_json_str(r#"{ "plumbing": { "balanced_channel_depth": 0 } }"#)
      .unwrap_err();
    assert!(matches!(
      err,
      ConfigError::Invalid {
        field: "plumbing.balanced_channel_depth",
        ..
      }
    ));
  }

  #[test]
  fn test_malformed_document_is_a_parse_error() {
    assert!(matches!(
      Config::from_json_str("{ runtime"),
      Err(ConfigError::Parse(_))
    ));
  }

  #[test]
  fn test_runtime_durations() {
    let runtime = RuntimeConfig::default()
      .with_poll_interval(Duration::from_millis(5))
      .with_close_timeout(Duration::from_secs(2));
    assert_eq!(runtime.poll_interval(), Duration::from_millis(5));
    assert_eq!(runtime.close_timeout(), Duration::from_secs(2));
  }
}

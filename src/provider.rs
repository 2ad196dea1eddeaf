//! # Provider
//!
//! [`DirectProvider`] creates topologies and runs them as jobs on a tokio
//! runtime. Jobs are numbered per provider: `JOB_0`, `JOB_1`, ...
//!
//! ```rust,no_run
//! use edgeflow::provider::DirectProvider;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = DirectProvider::new()?;
//! let topology = provider.new_topology("counter");
//! topology.of(1..=3)?.sink(|n| println!("{n}"))?;
//! let job = provider.submit(&topology).await?;
//! job.wait_closed(std::time::Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::JobError;
use crate::job::Job;
use crate::topology::Topology;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::debug;

/// Runs topologies on a tokio runtime.
#[derive(Debug)]
pub struct DirectProvider {
  runtime: Handle,
  config: Config,
  next_job: AtomicU64,
}

impl DirectProvider {
  /// A provider bound to the current tokio runtime, with default
  /// configuration.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::NoRuntime`] outside a tokio runtime.
  pub fn new() -> Result<Self, JobError> {
    Self::with_config(Config::default())
  }

  /// A provider bound to the current tokio runtime.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::NoRuntime`] outside a tokio runtime.
  pub fn with_config(config: Config) -> Result<Self, JobError> {
    let runtime = Handle::try_current().map_err(|e| JobError::NoRuntime(e.to_string()))?;
    Ok(Self::with_runtime(runtime, config))
  }

  /// A provider that runs its jobs on `runtime`.
  pub fn with_runtime(runtime: Handle, config: Config) -> Self {
    Self {
      runtime,
      config,
      next_job: AtomicU64::new(0),
    }
  }

  /// The provider's configuration.
  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Creates an empty topology that uses the provider's plumbing defaults.
  pub fn new_topology(&self, name: impl Into<String>) -> Topology {
    Topology::with_config(name, self.config.plumbing.clone())
  }

  /// Finalizes `topology` and starts it.
  ///
  /// Returns once every oplet is initialized and started. The topology can
  /// not be modified or submitted again afterwards.
  ///
  /// # Errors
  ///
  /// [`JobError::Graph`] for a structurally invalid topology, or
  /// [`JobError::Start`] when an oplet fails to initialize or start.
  pub async fn submit(&self, topology: &Topology) -> Result<Job, JobError> {
    let id = format!("JOB_{}", self.next_job.fetch_add(1, Ordering::Relaxed));
    debug!(job = %id, topology = %topology.name(), "submitting topology");
    Job::launch(id, topology, self.runtime.clone(), &self.config.runtime).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_outside_runtime_fails() {
    assert!(matches!(DirectProvider::new(), Err(JobError::NoRuntime(_))));
  }

  #[tokio::test]
  async fn test_topologies_use_provider_plumbing() {
    let config = Config {
      plumbing: crate::config::PlumbingConfig::default().with_barrier_queue_capacity(3),
      ..Config::default()
    };
    let provider = DirectProvider::with_config(config).unwrap();
    let topology = provider.new_topology("t");
    assert_eq!(topology.name(), "t");
    assert_eq!(topology.plumbing().barrier_queue_capacity, 3);
  }
}

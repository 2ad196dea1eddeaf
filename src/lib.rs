//! # Edgeflow
//!
//! In-process streaming dataflow for edge devices.
//!
//! Applications describe a [`Topology`](topology::Topology): sources feed
//! typed [`Stream`](topology::Stream)s, each stream operation appends an
//! oplet, and sinks terminate streams. A
//! [`DirectProvider`](provider::DirectProvider) submits the topology as a
//! [`Job`](job::Job) that runs on the tokio runtime under a task-tracking
//! scheduler.
//!
//! ## Key Features
//!
//! - **Arena Graph**: oplets and streams with stable ids, checked for cycles
//!   as edges are added
//! - **Plumbing**: pressure relief, gates, valves, pacing, isolation and
//!   concurrent/parallel fan-out
//! - **Fail-Fast Jobs**: the first uncaught task failure cancels the job and
//!   is reported once
//! - **Testing Support**: [`Tester`](tester::Tester) conditions for
//!   end-to-end checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgeflow::plumbing;
//! use edgeflow::provider::DirectProvider;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = DirectProvider::new()?;
//! let topology = provider.new_topology("greetings");
//! let words = topology.strings(["hello", "edge", "world"])?;
//! let paced = plumbing::blocking_throttle(&words, Duration::from_millis(300))?;
//! paced.map(|w| w.to_uppercase())?.sink(|w| println!("{w}"))?;
//!
//! let job = provider.submit(&topology).await?;
//! job.wait_closed(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Runtime and plumbing configuration.
pub mod config;
/// Error types and per-tuple error strategies.
pub mod error;
/// Arena graph of oplets and streams.
pub mod graph;
/// Running jobs and their lifecycle.
pub mod job;
/// The oplet trait and tuple plumbing between oplets.
pub mod oplet;
/// Built-in oplets: functional stages, sources and fan-in/fan-out.
pub mod oplets;
/// Flow-control operators.
pub mod plumbing;
/// Submitting topologies.
pub mod provider;
/// Task-tracking scheduler owned by each job.
pub mod scheduler;
/// Conditions and a runner for end-to-end topology checks.
pub mod tester;
/// Typed topology builder.
pub mod topology;

#[cfg(test)]
mod scheduler_test;

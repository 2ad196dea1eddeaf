//! # Plumbing
//!
//! Flow-control operators inserted into a topology by the application:
//!
//! - **Pacing**: [`blocking_delay`], [`blocking_throttle`],
//!   [`blocking_one_shot_delay`]
//! - **Back pressure relief**: [`pressure_reliever`] keeps the newest tuples
//!   per partition and drops the oldest
//! - **Admission control**: [`gate`] bounds in-flight tuples with a semaphore
//! - **Switching**: [`Valve`] and [`valve`]
//! - **Isolation**: [`isolate`] decouples a producer from slow consumers
//! - **Fan-out/fan-in**: [`concurrent`] / [`concurrent_map`] run every tuple
//!   through every channel and join the results in order; [`parallel`],
//!   [`parallel_map`] and [`parallel_balanced`] send each tuple through one
//!   channel and merge in completion order
//!
//! "Blocking" operators suspend the task delivering the tuple. Because tuples
//! are delivered by direct calls along a chain of oplets, that suspension
//! holds back every upstream stage up to the nearest queue.
//!
//! ## Example
//!
//! ```rust
//! use edgeflow::plumbing;
//! use edgeflow::topology::Topology;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), edgeflow::error::GraphError> {
//! let topology = Topology::new("sensors");
//! let readings = topology.poll(|| Some(21.5f64), Duration::from_millis(10))?;
//! let relieved = plumbing::pressure_reliever(&readings, |_| (), 5)?;
//! let paced = plumbing::blocking_throttle(&relieved, Duration::from_millis(100))?;
//! paced.sink(|reading| println!("{reading}"))?;
//! # Ok(())
//! # }
//! ```

mod concurrent;
mod gate;
pub(crate) mod isolate;
mod pacing;
mod parallel;
mod pressure_reliever;
mod valve;

pub use concurrent::{Mapper, Pipeline, concurrent, concurrent_map};
pub use gate::{Gate, gate};
pub use isolate::{Isolate, isolate};
pub use pacing::{blocking_delay, blocking_one_shot_delay, blocking_throttle};
pub use parallel::{parallel, parallel_balanced, parallel_map};
pub use pressure_reliever::{PressureReliever, pressure_reliever};
pub use valve::{Valve, valve};

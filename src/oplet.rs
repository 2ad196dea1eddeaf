//! # Oplets
//!
//! An oplet is one processing stage of a topology. The engine drives every
//! oplet through the same lifecycle:
//!
//! 1. `initialize` hands the oplet its [`OpletContext`]: the emitters for its
//!    output ports and the job's scheduler.
//! 2. `start` lets sources and stages that own background work schedule it.
//! 3. `process_port` is called once per tuple arriving on an input port.
//! 4. `close` releases resources when the job tears down.
//!
//! Each oplet instance sits behind its own async mutex, so `process` is never
//! re-entered concurrently for the same instance. Stages that want parallelism
//! fan out to independent oplet instances instead.
//!
//! ## Tuples
//!
//! Tuples travel between oplets type-erased as [`Tuple`]. Fan-out shares one
//! allocation between all consumers; [`from_tuple`] clones only when the value
//! is still shared.

use crate::error::OpletError;
use crate::graph::VertexId;
use crate::scheduler::TrackingScheduler;
use async_trait::async_trait;
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bound for values carried by streams.
pub trait TupleData: fmt::Debug + Clone + Send + Sync + 'static {}

impl<T> TupleData for T where T: fmt::Debug + Clone + Send + Sync + 'static {}

/// A type-erased tuple as it travels along an edge.
pub type Tuple = Arc<dyn Any + Send + Sync>;

/// Wraps a value into a [`Tuple`].
pub fn into_tuple<T: TupleData>(value: T) -> Tuple {
  Arc::new(value)
}

/// Recovers a typed value from a [`Tuple`].
///
/// # Errors
///
/// Returns [`OpletError::TypeMismatch`] if the tuple holds another type.
pub fn from_tuple<T: TupleData>(tuple: Tuple) -> Result<T, OpletError> {
  tuple
    .downcast::<T>()
    .map(Arc::unwrap_or_clone)
    .map_err(|_| OpletError::TypeMismatch {
      expected: type_name::<T>(),
    })
}

/// A processing stage.
#[async_trait]
pub trait Oplet: Send + 'static {
  /// Receives the context before any other call.
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError>;

  /// Called once every oplet of the job is initialized. Sources begin
  /// producing here.
  async fn start(&mut self) -> Result<(), OpletError> {
    Ok(())
  }

  /// Processes one tuple from input port 0.
  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    drop(tuple);
    Err(OpletError::NoSuchInput {
      oplet: type_name::<Self>().to_string(),
      port: 0,
    })
  }

  /// Processes one tuple from the given input port.
  ///
  /// Single-input oplets only implement [`Oplet::process`].
  async fn process_port(&mut self, port: usize, tuple: Tuple) -> Result<(), OpletError> {
    if port == 0 {
      self.process(tuple).await
    } else {
      Err(OpletError::NoSuchInput {
        oplet: type_name::<Self>().to_string(),
        port,
      })
    }
  }

  /// Releases resources held by the oplet.
  async fn close(&mut self) -> Result<(), OpletError> {
    Ok(())
  }
}

/// Shared, exclusively-locked slot holding one oplet instance of a running job.
pub(crate) type OpletCell = Arc<Mutex<Box<dyn Oplet>>>;

#[derive(Clone)]
pub(crate) struct Target {
  pub(crate) cell: OpletCell,
  pub(crate) port: usize,
}

/// Delivers tuples from one output port to every connected input.
///
/// `emit` calls each consumer directly and returns once all of them have
/// processed the tuple, so a slow consumer slows its producer. Consumers are
/// called in the order their edges were added.
#[derive(Clone)]
pub struct Emitter {
  targets: Arc<[Target]>,
}

impl Emitter {
  pub(crate) fn new(targets: Vec<Target>) -> Self {
    Self {
      targets: targets.into(),
    }
  }

  /// An emitter with no consumers; tuples are discarded.
  pub fn disconnected() -> Self {
    Self::new(Vec::new())
  }

  /// Number of connected consumers.
  pub fn consumer_count(&self) -> usize {
    self.targets.len()
  }

  /// Sends a tuple to every consumer.
  pub async fn emit(&self, tuple: Tuple) -> Result<(), OpletError> {
    for target in self.targets.iter() {
      let mut oplet = target.cell.lock().await;
      oplet.process_port(target.port, Arc::clone(&tuple)).await?;
    }
    Ok(())
  }

  /// Wraps and sends a typed value.
  pub async fn emit_value<T: TupleData>(&self, value: T) -> Result<(), OpletError> {
    self.emit(into_tuple(value)).await
  }
}

impl fmt::Debug for Emitter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Emitter")
      .field("consumers", &self.targets.len())
      .finish()
  }
}

/// Everything an oplet receives when it is initialized.
#[derive(Debug, Clone)]
pub struct OpletContext {
  vertex: VertexId,
  name: String,
  outputs: Vec<Emitter>,
  scheduler: TrackingScheduler,
}

impl OpletContext {
  pub(crate) fn new(
    vertex: VertexId,
    name: String,
    outputs: Vec<Emitter>,
    scheduler: TrackingScheduler,
  ) -> Self {
    Self {
      vertex,
      name,
      outputs,
      scheduler,
    }
  }

  /// Id of the oplet's vertex.
  pub fn vertex(&self) -> VertexId {
    self.vertex
  }

  /// Name of the oplet's vertex.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Emitter for output port 0, or a disconnected one for sinks.
  pub fn emitter(&self) -> Emitter {
    self
      .outputs
      .first()
      .cloned()
      .unwrap_or_else(Emitter::disconnected)
  }

  /// Emitter for output `port`.
  pub fn output(&self, port: usize) -> Option<Emitter> {
    self.outputs.get(port).cloned()
  }

  /// Number of output ports.
  pub fn output_count(&self) -> usize {
    self.outputs.len()
  }

  /// The job's scheduler.
  pub fn scheduler(&self) -> &TrackingScheduler {
    &self.scheduler
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_tuple_round_trips_value() {
    let tuple = into_tuple(String::from("reading"));
    assert_eq!(from_tuple::<String>(tuple).unwrap(), "reading");
  }

  #[test]
  fn test_from_tuple_rejects_other_type() {
    let err = from_tuple::<u64>(into_tuple(1.5f64)).unwrap_err();
    assert!(matches!(err, OpletError::TypeMismatch { expected: "u64" }));
  }

  #[test]
  fn test_shared_tuple_is_cloned_out() {
    let tuple = into_tuple(vec![1, 2, 3]);
    let other = Arc::clone(&tuple);
    assert_eq!(from_tuple::<Vec<i32>>(tuple).unwrap(), vec![1, 2, 3]);
    assert_eq!(from_tuple::<Vec<i32>>(other).unwrap(), vec![1, 2, 3]);
  }
}

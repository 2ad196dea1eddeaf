//! # Error Handling
//!
//! Error types for every layer of the engine, plus the per-tuple error
//! strategy vocabulary used by fallible stream operations.
//!
//! ## Error Taxonomy
//!
//! - **GraphError**: structural violations found while building a topology
//!   (unknown ids, port misuse, cycles, mutation after submission). Always
//!   returned synchronously to the caller.
//! - **OpletError**: an error raised by an oplet while initializing,
//!   processing a tuple or closing.
//! - **TaskFailure**: an error or panic that escaped a scheduled task. Reported
//!   once through the scheduler's completion callback and fatal for the job.
//! - **JobError**: submission and job-control failures.
//!
//! ## Per-Tuple Error Strategies
//!
//! Fallible transforms (see [`crate::topology::Stream::try_map`]) consult an
//! [`ErrorStrategy`] to decide what to do with a failing tuple:
//!
//! - **Stop**: propagate the error, escalating it to a [`TaskFailure`]
//! - **Skip**: log the error and drop the tuple
//! - **Retry(n)**: re-invoke the transform up to `n` more times
//! - **Custom**: user-defined handler returning an [`ErrorAction`]
//!
//! ## Example
//!
//! ```rust
//! use edgeflow::error::{ErrorAction, ErrorStrategy};
//!
//! let strategy = ErrorStrategy::<i32>::new_custom(|error| {
//!     if error.retries < 2 {
//!         ErrorAction::Retry
//!     } else {
//!         ErrorAction::Skip
//!     }
//! });
//! assert!(matches!(strategy, ErrorStrategy::Custom(_)));
//! ```

use crate::graph::{StreamId, VertexId};
use crate::scheduler::TaskId;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error type accepted from user code.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Structural errors raised while building or finalizing a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
  /// The vertex id does not belong to this graph.
  #[error("unknown vertex {0}")]
  UnknownVertex(VertexId),
  /// The stream id does not belong to this graph.
  #[error("unknown stream {0}")]
  UnknownStream(StreamId),
  /// An input or output port index is outside the vertex's arity.
  #[error("vertex {vertex} has {arity} port(s), port {port} is out of range")]
  PortOutOfRange {
    /// Vertex being connected.
    vertex: VertexId,
    /// Offending port index.
    port: usize,
    /// Number of ports the vertex declares.
    arity: usize,
  },
  /// An input port already has a producing stream.
  #[error("input port {port} of vertex {vertex} is already connected")]
  InputAlreadyConnected {
    /// Vertex being connected.
    vertex: VertexId,
    /// Input port index.
    port: usize,
  },
  /// The connection would close a cycle.
  #[error("connecting {stream} to vertex {target} would create a cycle")]
  Cycle {
    /// Stream being connected.
    stream: StreamId,
    /// Target vertex of the rejected edge.
    target: VertexId,
  },
  /// An input port was left unconnected at submission time.
  #[error("input port {port} of vertex {vertex} ('{name}') is not connected")]
  UnconnectedInput {
    /// Vertex with the dangling input.
    vertex: VertexId,
    /// Name of the vertex.
    name: String,
    /// Input port index.
    port: usize,
  },
  /// The stream belongs to a different topology.
  #[error("stream {0} belongs to another topology")]
  ForeignStream(StreamId),
  /// A fan-in or fan-out stage needs at least one channel.
  #[error("'{0}' requires a width of at least 1")]
  ZeroWidth(&'static str),
  /// The graph was already submitted and can no longer change.
  #[error("graph '{0}' has been submitted and is immutable")]
  Finalized(String),
}

/// Errors raised by oplets.
#[derive(Debug, thiserror::Error)]
pub enum OpletError {
  /// A tuple did not have the type the oplet was built for.
  #[error("tuple type mismatch: expected {expected}")]
  TypeMismatch {
    /// Name of the expected Rust type.
    expected: &'static str,
  },
  /// An input arrived on a port the oplet does not have.
  #[error("oplet '{oplet}' has no input port {port}")]
  NoSuchInput {
    /// Oplet name.
    oplet: String,
    /// Port index the tuple was delivered to.
    port: usize,
  },
  /// A queue or semaphore used by the oplet has been closed.
  #[error("'{0}' was closed")]
  Closed(String),
  /// The oplet was used before `initialize` ran.
  #[error("oplet '{0}' is not initialized")]
  NotInitialized(String),
  /// A user function failed and the error strategy asked to stop.
  #[error(transparent)]
  Stream(#[from] StringError),
  /// Any other error produced by user code.
  #[error("{0}")]
  Other(BoxError),
}

impl OpletError {
  /// Wraps an arbitrary error.
  pub fn other<E>(error: E) -> Self
  where
    E: Into<BoxError>,
  {
    OpletError::Other(error.into())
  }
}

/// Why a scheduled task terminated abnormally.
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
  /// The task body returned an error.
  #[error(transparent)]
  Error(#[from] OpletError),
  /// The task body panicked.
  #[error("panicked: {0}")]
  Panic(String),
}

/// An uncaught error that escaped a scheduled task.
#[derive(Debug, thiserror::Error)]
#[error("task {task_id} ('{task}') failed: {cause}")]
pub struct TaskFailure {
  /// Id of the failed task.
  pub task_id: TaskId,
  /// Name the task was scheduled under.
  pub task: String,
  /// The underlying cause.
  #[source]
  pub cause: FailureCause,
}

/// Errors raised while submitting or controlling a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
  /// The topology was structurally invalid.
  #[error(transparent)]
  Graph(#[from] GraphError),
  /// An oplet failed to initialize or start.
  #[error("oplet '{name}' failed to start: {source}")]
  Start {
    /// Oplet name.
    name: String,
    /// Underlying oplet error.
    #[source]
    source: OpletError,
  },
  /// No tokio runtime was available to execute the job.
  #[error("no tokio runtime available: {0}")]
  NoRuntime(String),
  /// A wait on the job did not finish in time.
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  /// The job terminated because a task failed.
  #[error(transparent)]
  Failed(Arc<TaskFailure>),
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The document could not be parsed.
  #[error("invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
  /// A value was outside its allowed range.
  #[error("invalid value for '{field}': {reason}")]
  Invalid {
    /// Offending field.
    field: &'static str,
    /// Human readable reason.
    reason: String,
  },
}

/// Action to take when a tuple fails to process.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorAction {
  /// Propagate the error, failing the task that delivered the tuple.
  Stop,
  /// Drop the tuple and continue with the next one.
  Skip,
  /// Invoke the function again with the same tuple.
  Retry,
}

type CustomErrorHandler<T> = Arc<dyn Fn(&StreamError<T>) -> ErrorAction + Send + Sync>;

/// Strategy for handling per-tuple errors.
///
/// # Example
///
/// ```rust
/// use edgeflow::error::ErrorStrategy;
///
/// // Stop on first error (default)
/// let strategy = ErrorStrategy::<String>::Stop;
///
/// // Retry up to 3 times before stopping
/// let strategy = ErrorStrategy::<String>::Retry(3);
/// ```
pub enum ErrorStrategy<T> {
  /// Stop processing immediately. This is the default.
  Stop,
  /// Skip failing tuples and continue.
  Skip,
  /// Retry a failing tuple up to the given number of times, then stop.
  Retry(usize),
  /// Custom handling logic.
  Custom(CustomErrorHandler<T>),
}

impl<T> Default for ErrorStrategy<T> {
  fn default() -> Self {
    ErrorStrategy::Stop
  }
}

impl<T> Clone for ErrorStrategy<T> {
  fn clone(&self) -> Self {
    match self {
      ErrorStrategy::Stop => ErrorStrategy::Stop,
      ErrorStrategy::Skip => ErrorStrategy::Skip,
      ErrorStrategy::Retry(n) => ErrorStrategy::Retry(*n),
      ErrorStrategy::Custom(handler) => ErrorStrategy::Custom(handler.clone()),
    }
  }
}

impl<T> fmt::Debug for ErrorStrategy<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorStrategy::Stop => write!(f, "ErrorStrategy::Stop"),
      ErrorStrategy::Skip => write!(f, "ErrorStrategy::Skip"),
      ErrorStrategy::Retry(n) => write!(f, "ErrorStrategy::Retry({})", n),
      ErrorStrategy::Custom(_) => write!(f, "ErrorStrategy::Custom"),
    }
  }
}

impl<T> PartialEq for ErrorStrategy<T> {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ErrorStrategy::Stop, ErrorStrategy::Stop) => true,
      (ErrorStrategy::Skip, ErrorStrategy::Skip) => true,
      (ErrorStrategy::Retry(n1), ErrorStrategy::Retry(n2)) => n1 == n2,
      (ErrorStrategy::Custom(_), ErrorStrategy::Custom(_)) => true,
      _ => false,
    }
  }
}

impl<T> ErrorStrategy<T> {
  /// Creates a custom strategy from a handler function.
  pub fn new_custom<F>(f: F) -> Self
  where
    F: Fn(&StreamError<T>) -> ErrorAction + Send + Sync + 'static,
  {
    Self::Custom(Arc::new(f))
  }

  /// Decides the action for a failed tuple.
  pub fn action_for(&self, error: &StreamError<T>) -> ErrorAction {
    match self {
      ErrorStrategy::Stop => ErrorAction::Stop,
      ErrorStrategy::Skip => ErrorAction::Skip,
      ErrorStrategy::Retry(n) if error.retries < *n => ErrorAction::Retry,
      ErrorStrategy::Retry(_) => ErrorAction::Stop,
      ErrorStrategy::Custom(handler) => handler(error),
    }
  }
}

/// Error that occurred while processing a single tuple.
#[derive(Debug)]
pub struct StreamError<T> {
  /// The original error.
  pub source: BoxError,
  /// When and where the error occurred.
  pub context: ErrorContext<T>,
  /// The component that raised it.
  pub component: ComponentInfo,
  /// How many times the tuple has been retried so far.
  pub retries: usize,
}

impl<T> StreamError<T> {
  /// Creates a new error with a retry count of zero.
  pub fn new(source: BoxError, context: ErrorContext<T>, component: ComponentInfo) -> Self {
    Self {
      source,
      context,
      component,
      retries: 0,
    }
  }
}

impl<T> fmt::Display for StreamError<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Error in {} ({}): {}",
      self.component.name, self.component.type_name, self.source
    )
  }
}

impl<T: fmt::Debug> Error for StreamError<T> {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(self.source.as_ref())
  }
}

/// A simple error type wrapping a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringError(pub String);

impl fmt::Display for StringError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl Error for StringError {}

impl<T> From<StreamError<T>> for StringError {
  fn from(error: StreamError<T>) -> Self {
    StringError(format!(
      "{} after {} retr{}",
      error,
      error.retries,
      if error.retries == 1 { "y" } else { "ies" }
    ))
  }
}

/// Context about when and where an error occurred.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext<T> {
  /// When the error occurred.
  pub timestamp: chrono::DateTime<chrono::Utc>,
  /// The tuple being processed, if available.
  pub item: Option<T>,
  /// Name of the component that raised the error.
  pub component_name: String,
  /// Type of the component that raised the error.
  pub component_type: String,
}

impl<T> ErrorContext<T> {
  /// Creates a context stamped with the current time.
  pub fn now(item: Option<T>, component: &ComponentInfo) -> Self {
    Self {
      timestamp: chrono::Utc::now(),
      item,
      component_name: component.name.clone(),
      component_type: component.type_name.clone(),
    }
  }
}

/// Identifies a component for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
  /// Component name.
  pub name: String,
  /// Component type name.
  pub type_name: String,
}

impl ComponentInfo {
  /// Creates a new `ComponentInfo`.
  pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      type_name: type_name.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn stream_error(retries: usize) -> StreamError<i32> {
    let component = ComponentInfo::new("parse", "TryMap");
    let mut error = StreamError::new(
      Box::new(StringError("bad input".to_string())),
      ErrorContext::now(Some(7), &component),
      component,
    );
    error.retries = retries;
    error
  }

  #[test]
  fn test_retry_strategy_stops_after_limit() {
    let strategy = ErrorStrategy::Retry(2);
    assert_eq!(strategy.action_for(&stream_error(0)), ErrorAction::Retry);
    assert_eq!(strategy.action_for(&stream_error(1)), ErrorAction::Retry);
    assert_eq!(strategy.action_for(&stream_error(2)), ErrorAction::Stop);
  }

  #[test]
  fn test_custom_strategy_sees_context() {
    let strategy = ErrorStrategy::new_custom(|error: &StreamError<i32>| {
      if error.context.item == Some(7) {
        ErrorAction::Skip
      } else {
        ErrorAction::Stop
      }
    });
    assert_eq!(strategy.action_for(&stream_error(0)), ErrorAction::Skip);
  }

  #[test]
  fn test_stream_error_display_names_component() {
    let message: StringError = stream_error(1).into();
    assert_eq!(message.0, "Error in parse (TryMap): bad input after 1 retry");
  }
}

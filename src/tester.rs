//! # Tester
//!
//! Conditions observe streams from a sink and a [`Tester`] runs a topology
//! until a condition holds, the job closes on its own, or a timeout expires.
//!
//! ```rust,no_run
//! use edgeflow::provider::DirectProvider;
//! use edgeflow::tester::{self, Tester};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = DirectProvider::new()?;
//! let topology = provider.new_topology("words");
//! let words = topology.strings(["a", "b", "c"])?;
//! let contents = tester::stream_contents(&words, vec!["a".to_string(), "b".into(), "c".into()])?;
//! let valid = Tester::default()
//!   .complete(&provider, &topology, Arc::new(contents.clone()), Duration::from_secs(5))
//!   .await?;
//! assert!(valid);
//! # Ok(())
//! # }
//! ```

use crate::config::RuntimeConfig;
use crate::error::{GraphError, JobError};
use crate::job::JobState;
use crate::oplet::TupleData;
use crate::provider::DirectProvider;
use crate::topology::{Stream, Topology};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A predicate over what a running topology has produced so far.
pub trait Condition: Send + Sync {
  /// Whether the condition currently holds.
  fn valid(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum CountRule {
  Exactly,
  AtLeast,
}

/// Counts the tuples reaching a sink.
#[derive(Debug, Clone)]
pub struct TupleCount {
  seen: Arc<AtomicUsize>,
  expected: usize,
  rule: CountRule,
}

impl TupleCount {
  /// Number of tuples seen so far.
  pub fn result(&self) -> usize {
    self.seen.load(Ordering::SeqCst)
  }
}

impl Condition for TupleCount {
  fn valid(&self) -> bool {
    match self.rule {
      CountRule::Exactly => self.result() == self.expected,
      CountRule::AtLeast => self.result() >= self.expected,
    }
  }
}

/// Valid once `stream` has delivered exactly `expected` tuples.
pub fn tuple_count<T: TupleData>(stream: &Stream<T>, expected: usize) -> Result<TupleCount, GraphError> {
  counter(stream, expected, CountRule::Exactly)
}

/// Valid once `stream` has delivered at least `expected` tuples.
pub fn at_least_tuple_count<T: TupleData>(
  stream: &Stream<T>,
  expected: usize,
) -> Result<TupleCount, GraphError> {
  counter(stream, expected, CountRule::AtLeast)
}

fn counter<T: TupleData>(
  stream: &Stream<T>,
  expected: usize,
  rule: CountRule,
) -> Result<TupleCount, GraphError> {
  let seen = Arc::new(AtomicUsize::new(0));
  let sink_seen = Arc::clone(&seen);
  stream.sink(move |_| {
    sink_seen.fetch_add(1, Ordering::SeqCst);
  })?;
  Ok(TupleCount {
    seen,
    expected,
    rule,
  })
}

/// Records the tuples reaching a sink and compares them with an expected
/// sequence.
#[derive(Debug, Clone)]
pub struct Contents<T> {
  seen: Arc<Mutex<Vec<T>>>,
  expected: Vec<T>,
  ordered: bool,
}

impl<T: Clone> Contents<T> {
  /// Tuples seen so far, in arrival order.
  pub fn result(&self) -> Vec<T> {
    self
      .seen
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl<T: PartialEq + Send + Sync> Condition for Contents<T> {
  fn valid(&self) -> bool {
    let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
    if seen.len() != self.expected.len() {
      return false;
    }
    if self.ordered {
      return *seen == self.expected;
    }
    let mut matched = vec![false; seen.len()];
    self.expected.iter().all(|want| {
      let hit = seen
        .iter()
        .enumerate()
        .find(|(i, got)| !matched[*i] && *got == want)
        .map(|(i, _)| i);
      match hit {
        Some(i) => {
          matched[i] = true;
          true
        }
        None => false,
      }
    })
  }
}

/// Valid once `stream` has delivered exactly `expected`, in order.
pub fn stream_contents<T>(stream: &Stream<T>, expected: Vec<T>) -> Result<Contents<T>, GraphError>
where
  T: TupleData + PartialEq,
{
  recorder(stream, expected, true)
}

/// Valid once `stream` has delivered exactly the tuples of `expected`, in
/// any order.
pub fn contents_unordered<T>(stream: &Stream<T>, expected: Vec<T>) -> Result<Contents<T>, GraphError>
where
  T: TupleData + PartialEq,
{
  recorder(stream, expected, false)
}

fn recorder<T: TupleData>(
  stream: &Stream<T>,
  expected: Vec<T>,
  ordered: bool,
) -> Result<Contents<T>, GraphError> {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let sink_seen = Arc::clone(&seen);
  stream.sink(move |value| {
    sink_seen
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(value);
  })?;
  Ok(Contents {
    seen,
    expected,
    ordered,
  })
}

/// Valid when every wrapped condition is valid.
pub struct And {
  conditions: Vec<Arc<dyn Condition>>,
}

impl Condition for And {
  fn valid(&self) -> bool {
    self.conditions.iter().all(|condition| condition.valid())
  }
}

/// Combines conditions; valid when all of them are.
pub fn and(conditions: Vec<Arc<dyn Condition>>) -> And {
  And { conditions }
}

/// Runs topologies until a condition holds.
#[derive(Debug, Clone)]
pub struct Tester {
  poll_interval: Duration,
  close_timeout: Duration,
}

impl Default for Tester {
  fn default() -> Self {
    Self::new(&RuntimeConfig::default())
  }
}

impl Tester {
  /// A tester using the polling and close settings of `config`.
  pub fn new(config: &RuntimeConfig) -> Self {
    Self {
      poll_interval: config.poll_interval(),
      close_timeout: config.close_timeout(),
    }
  }

  /// Submits `topology`, waits until `condition` is valid, the job closes or
  /// `timeout` elapses, then stops the job and waits for it to close.
  ///
  /// Returns whether the condition held at the end.
  ///
  /// # Errors
  ///
  /// Submission errors, [`JobError::Timeout`] when the job does not close
  /// after the stop, and [`JobError::Failed`] when a task failed.
  pub async fn complete(
    &self,
    provider: &DirectProvider,
    topology: &Topology,
    condition: Arc<dyn Condition>,
    timeout: Duration,
  ) -> Result<bool, JobError> {
    let job = provider.submit(topology).await?;
    let deadline = Instant::now() + timeout;
    while !condition.valid() && job.state() != JobState::Closed && Instant::now() < deadline {
      tokio::time::sleep(self.poll_interval).await;
    }
    let valid = condition.valid();
    debug!(job = %job.id(), valid, state = ?job.state(), "completion wait finished");

    job.request_stop();
    job.wait_closed(self.close_timeout).await?;
    match job.last_error() {
      Some(failure) => Err(JobError::Failed(failure)),
      None => Ok(valid),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn contents(seen: Vec<i32>, expected: Vec<i32>, ordered: bool) -> Contents<i32> {
    Contents {
      seen: Arc::new(Mutex::new(seen)),
      expected,
      ordered,
    }
  }

  #[test]
  fn test_ordered_contents_require_order() {
    assert!(contents(vec![1, 2, 3], vec![1, 2, 3], true).valid());
    assert!(!contents(vec![2, 1, 3], vec![1, 2, 3], true).valid());
  }

  #[test]
  fn test_unordered_contents_match_multiset() {
    assert!(contents(vec![2, 1, 2], vec![1, 2, 2], false).valid());
    assert!(!contents(vec![2, 1, 1], vec![1, 2, 2], false).valid());
    assert!(!contents(vec![1, 2], vec![1, 2, 2], false).valid());
  }

  #[test]
  fn test_at_least_count() {
    let count = TupleCount {
      seen: Arc::new(AtomicUsize::new(5)),
      expected: 3,
      rule: CountRule::AtLeast,
    };
    assert!(count.valid());
    let exact = TupleCount {
      rule: CountRule::Exactly,
      ..count.clone()
    };
    assert!(!exact.valid());
  }

  #[test]
  fn test_and_requires_all() {
    let yes: Arc<dyn Condition> = Arc::new(contents(vec![1], vec![1], true));
    let no: Arc<dyn Condition> = Arc::new(contents(vec![], vec![1], true));
    assert!(and(vec![Arc::clone(&yes), Arc::clone(&yes)]).valid());
    assert!(!and(vec![yes, no]).valid());
  }
}

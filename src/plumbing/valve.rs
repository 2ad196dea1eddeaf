//! A switchable on/off filter.

use crate::error::GraphError;
use crate::oplet::TupleData;
use crate::topology::Stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A thread-safe open/closed switch.
///
/// Clones share the same state, so a valve can be handed to a control thread
/// while the stream it guards keeps running.
#[derive(Debug, Clone)]
pub struct Valve {
  open: Arc<AtomicBool>,
}

impl Default for Valve {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Valve {
  /// Creates a valve in the given state.
  pub fn new(open: bool) -> Self {
    Self {
      open: Arc::new(AtomicBool::new(open)),
    }
  }

  /// Opens or closes the valve.
  pub fn set_open(&self, open: bool) {
    self.open.store(open, Ordering::SeqCst);
  }

  /// Whether tuples currently pass.
  pub fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }
}

/// Passes every tuple of `stream` while `valve` is open and drops them while
/// it is closed.
pub fn valve<T: TupleData>(stream: &Stream<T>, valve: &Valve) -> Result<Stream<T>, GraphError> {
  let valve = valve.clone();
  stream.filter(move |_| valve.is_open())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_valve_defaults_open() {
    assert!(Valve::default().is_open());
    assert!(!Valve::new(false).is_open());
  }

  #[test]
  fn test_set_open_is_idempotent() {
    let valve = Valve::new(true);
    valve.set_open(false);
    valve.set_open(false);
    assert!(!valve.is_open());
    valve.set_open(true);
    valve.set_open(true);
    assert!(valve.is_open());
  }

  #[test]
  fn test_state_is_visible_across_threads() {
    let valve = Valve::new(true);
    let remote = valve.clone();
    std::thread::spawn(move || remote.set_open(false))
      .join()
      .unwrap();
    assert!(!valve.is_open());
  }
}

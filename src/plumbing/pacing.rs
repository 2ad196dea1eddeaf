//! Delays and throttles that slow the producing side down.
//!
//! Each of these suspends the task delivering the tuple, so the upstream
//! producer is held back for as long as the tuple is.

use crate::error::{GraphError, OpletError};
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData};
use crate::topology::Stream;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Delays every tuple by `delay` before forwarding it.
pub fn blocking_delay<T: TupleData>(
  stream: &Stream<T>,
  delay: Duration,
) -> Result<Stream<T>, GraphError> {
  stream.pipe("blocking_delay", Pacer::new(Pacing::Delay(delay)))
}

/// Forwards tuples no faster than one per `interval`.
pub fn blocking_throttle<T: TupleData>(
  stream: &Stream<T>,
  interval: Duration,
) -> Result<Stream<T>, GraphError> {
  stream.pipe(
    "blocking_throttle",
    Pacer::new(Pacing::Throttle {
      interval,
      last: None,
    }),
  )
}

/// Delays only the first tuple by `delay`; later tuples pass straight
/// through.
pub fn blocking_one_shot_delay<T: TupleData>(
  stream: &Stream<T>,
  delay: Duration,
) -> Result<Stream<T>, GraphError> {
  stream.pipe(
    "blocking_one_shot_delay",
    Pacer::new(Pacing::OneShot { delay, fired: false }),
  )
}

#[derive(Debug)]
enum Pacing {
  Delay(Duration),
  Throttle {
    interval: Duration,
    last: Option<Instant>,
  },
  OneShot {
    delay: Duration,
    fired: bool,
  },
}

impl Pacing {
  /// How long to hold the current tuple. Updates the pacing state as if the
  /// tuple is forwarded right after the wait.
  fn wait(&mut self) -> Duration {
    match self {
      Pacing::Delay(delay) => *delay,
      Pacing::Throttle { interval, last } => {
        let now = Instant::now();
        let wait = last
          .map(|previous| interval.saturating_sub(now.duration_since(previous)))
          .unwrap_or(Duration::ZERO);
        *last = Some(now + wait);
        wait
      }
      Pacing::OneShot { delay, fired } => {
        if std::mem::replace(fired, true) {
          Duration::ZERO
        } else {
          *delay
        }
      }
    }
  }
}

/// Oplet behind the pacing functions.
struct Pacer {
  pacing: Pacing,
  emitter: Option<Emitter>,
  name: String,
}

impl Pacer {
  fn new(pacing: Pacing) -> Self {
    Self {
      pacing,
      emitter: None,
      name: String::new(),
    }
  }
}

#[async_trait]
impl Oplet for Pacer {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let wait = self.pacing.wait();
    if !wait.is_zero() {
      tokio::time::sleep(wait).await;
    }
    match &self.emitter {
      Some(emitter) => emitter.emit(tuple).await,
      None => Err(OpletError::NotInitialized(self.name.clone())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_throttle_waits_out_the_interval() {
    let mut pacing = Pacing::Throttle {
      interval: Duration::from_millis(300),
      last: None,
    };
    assert_eq!(pacing.wait(), Duration::ZERO);
    let second = pacing.wait();
    assert!(second > Duration::from_millis(250));
    assert!(second <= Duration::from_millis(300));
  }

  #[test]
  fn test_one_shot_delays_only_first() {
    let mut pacing = Pacing::OneShot {
      delay: Duration::from_millis(50),
      fired: false,
    };
    assert_eq!(pacing.wait(), Duration::from_millis(50));
    assert_eq!(pacing.wait(), Duration::ZERO);
    assert_eq!(pacing.wait(), Duration::ZERO);
  }

  #[test]
  fn test_delay_is_constant() {
    let mut pacing = Pacing::Delay(Duration::from_millis(20));
    assert_eq!(pacing.wait(), Duration::from_millis(20));
    assert_eq!(pacing.wait(), Duration::from_millis(20));
  }
}

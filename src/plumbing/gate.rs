//! Semaphore-bounded admission.

use crate::error::{GraphError, OpletError};
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData};
use crate::topology::Stream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Admits a tuple only after acquiring a permit from `semaphore`.
///
/// The permit is not returned by the gate. Downstream code calls
/// `semaphore.add_permits(1)` once it is ready for another tuple, so at most
/// the initial permit count of tuples are admitted but not yet released.
/// While no permit is available the producer waits.
pub fn gate<T: TupleData>(
  stream: &Stream<T>,
  semaphore: Arc<Semaphore>,
) -> Result<Stream<T>, GraphError> {
  stream.pipe("gate", Gate::new(semaphore))
}

/// Oplet behind [`gate`].
pub struct Gate {
  semaphore: Arc<Semaphore>,
  name: String,
  emitter: Option<Emitter>,
}

impl Gate {
  /// Creates the oplet.
  pub fn new(semaphore: Arc<Semaphore>) -> Self {
    Self {
      semaphore,
      name: String::new(),
      emitter: None,
    }
  }
}

#[async_trait]
impl Oplet for Gate {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    self
      .semaphore
      .acquire()
      .await
      .map_err(|_| OpletError::Closed(self.name.clone()))?
      .forget();
    match &self.emitter {
      Some(emitter) => emitter.emit(tuple).await,
      None => Err(OpletError::NotInitialized(self.name.clone())),
    }
  }
}

//! Source oplets: iterated sequences, periodic polls and event callbacks.
//!
//! Every source schedules its work on the job's scheduler when it is started,
//! so the work is tracked and cancelled with the job.

use crate::error::OpletError;
use crate::oplet::{Emitter, Oplet, OpletContext, TupleData};
use crate::scheduler::{TaskHandle, TrackingScheduler};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

struct Started {
  name: String,
  emitter: Emitter,
  scheduler: TrackingScheduler,
}

impl Started {
  fn from_context(ctx: &OpletContext) -> Self {
    Self {
      name: ctx.name().to_string(),
      emitter: ctx.emitter(),
      scheduler: ctx.scheduler().clone(),
    }
  }
}

/// Emits every item of an iterator, finite or endless.
pub struct IterSource<I> {
  iter: Option<I>,
  ctx: Option<Started>,
  task: Option<TaskHandle>,
}

impl<I> IterSource<I>
where
  I: Iterator + Send + 'static,
  I::Item: TupleData,
{
  /// Creates the source.
  pub fn new(iter: I) -> Self {
    Self {
      iter: Some(iter),
      ctx: None,
      task: None,
    }
  }
}

#[async_trait]
impl<I> Oplet for IterSource<I>
where
  I: Iterator + Send + 'static,
  I::Item: TupleData,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.ctx = Some(Started::from_context(&ctx));
    Ok(())
  }

  async fn start(&mut self) -> Result<(), OpletError> {
    let started = self
      .ctx
      .as_ref()
      .ok_or_else(|| OpletError::NotInitialized("source".to_string()))?;
    let Some(iter) = self.iter.take() else {
      return Ok(());
    };
    let emitter = started.emitter.clone();
    self.task = Some(started.scheduler.submit(started.name.clone(), async move {
      for item in iter {
        emitter.emit_value(item).await?;
        tokio::task::yield_now().await;
      }
      Ok(())
    }));
    Ok(())
  }

  async fn close(&mut self) -> Result<(), OpletError> {
    if let Some(task) = self.task.take() {
      task.cancel(true);
    }
    Ok(())
  }
}

/// Calls a supplier every period and emits the values it returns.
pub struct PollSource<T, F> {
  supplier: Option<F>,
  period: Duration,
  ctx: Option<Started>,
  task: Option<TaskHandle>,
  _type: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> PollSource<T, F>
where
  T: TupleData,
  F: FnMut() -> Option<T> + Send + 'static,
{
  /// Creates the source. `None` results are skipped.
  pub fn new(supplier: F, period: Duration) -> Self {
    Self {
      supplier: Some(supplier),
      period,
      ctx: None,
      task: None,
      _type: std::marker::PhantomData,
    }
  }
}

#[async_trait]
impl<T, F> Oplet for PollSource<T, F>
where
  T: TupleData,
  F: FnMut() -> Option<T> + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.ctx = Some(Started::from_context(&ctx));
    Ok(())
  }

  async fn start(&mut self) -> Result<(), OpletError> {
    let started = self
      .ctx
      .as_ref()
      .ok_or_else(|| OpletError::NotInitialized("poll".to_string()))?;
    let Some(mut supplier) = self.supplier.take() else {
      return Ok(());
    };
    let emitter = started.emitter.clone();
    self.task = Some(started.scheduler.schedule_periodic(
      started.name.clone(),
      Duration::ZERO,
      self.period,
      move || {
        let value = supplier();
        let emitter = emitter.clone();
        async move {
          match value {
            Some(value) => emitter.emit_value(value).await,
            None => Ok(()),
          }
        }
      },
    ));
    Ok(())
  }

  async fn close(&mut self) -> Result<(), OpletError> {
    if let Some(task) = self.task.take() {
      task.cancel(true);
    }
    Ok(())
  }
}

/// Callback handed to event sources for submitting tuples from any thread.
pub struct Submitter<T> {
  sender: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Submitter<T> {
  fn clone(&self) -> Self {
    Self {
      sender: self.sender.clone(),
    }
  }
}

impl<T> fmt::Debug for Submitter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Submitter")
      .field("closed", &self.sender.is_closed())
      .finish()
  }
}

impl<T> Submitter<T> {
  /// Queues a tuple without blocking. Returns `false` once the job is gone.
  pub fn submit(&self, value: T) -> bool {
    self.sender.send(value).is_ok()
  }
}

/// Source fed by an external event callback.
///
/// The setup function runs once when the job starts and receives a
/// [`Submitter`]. Submitted tuples are queued and emitted by a separate task,
/// so the submitting thread never waits on downstream processing.
pub struct EventSource<T, S> {
  setup: Option<S>,
  receiver: Option<mpsc::UnboundedReceiver<T>>,
  submitter: Option<Submitter<T>>,
  ctx: Option<Started>,
}

impl<T, S> EventSource<T, S>
where
  T: TupleData,
  S: FnOnce(Submitter<T>) + Send + 'static,
{
  /// Creates the source.
  pub fn new(setup: S) -> Self {
    Self {
      setup: Some(setup),
      receiver: None,
      submitter: None,
      ctx: None,
    }
  }
}

#[async_trait]
impl<T, S> Oplet for EventSource<T, S>
where
  T: TupleData,
  S: FnOnce(Submitter<T>) + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    let (sender, receiver) = mpsc::unbounded_channel();
    self.submitter = Some(Submitter { sender });
    self.receiver = Some(receiver);
    self.ctx = Some(Started::from_context(&ctx));
    Ok(())
  }

  async fn start(&mut self) -> Result<(), OpletError> {
    let started = self
      .ctx
      .as_ref()
      .ok_or_else(|| OpletError::NotInitialized("events".to_string()))?;
    let (Some(mut receiver), Some(submitter)) = (self.receiver.take(), self.submitter.take())
    else {
      return Ok(());
    };
    let emitter = started.emitter.clone();
    let name = started.name.clone();
    started.scheduler.submit(format!("{name}.drain"), async move {
      while let Some(value) = receiver.recv().await {
        emitter.emit_value(value).await?;
      }
      debug!(source = %name, "all event submitters dropped");
      Ok(())
    });
    if let Some(setup) = self.setup.take() {
      setup(submitter);
    }
    Ok(())
  }
}

//! Fan-out and fan-in oplets.
//!
//! - [`Split`]: one input, `width` outputs; each tuple goes to exactly one.
//! - [`Union`]: `width` inputs merged into one output in arrival order.
//! - [`Barrier`]: `width` inputs joined index by index into a `Vec`.

use crate::error::OpletError;
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData, from_tuple};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

/// Routes each tuple to one output port chosen by a splitter.
///
/// The splitter's index is taken modulo the width; `None` discards the tuple.
pub struct Split<T, F> {
  splitter: F,
  outputs: Vec<Emitter>,
  _type: PhantomData<fn(T)>,
}

impl<T, F> Split<T, F>
where
  T: TupleData,
  F: FnMut(&T) -> Option<usize> + Send + 'static,
{
  /// Creates the oplet.
  pub fn new(splitter: F) -> Self {
    Self {
      splitter,
      outputs: Vec::new(),
      _type: PhantomData,
    }
  }
}

#[async_trait]
impl<T, F> Oplet for Split<T, F>
where
  T: TupleData,
  F: FnMut(&T) -> Option<usize> + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.outputs = (0..ctx.output_count())
      .filter_map(|port| ctx.output(port))
      .collect();
    if self.outputs.is_empty() {
      return Err(OpletError::NotInitialized(ctx.name().to_string()));
    }
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let value = tuple
      .downcast_ref::<T>()
      .ok_or(OpletError::TypeMismatch {
        expected: std::any::type_name::<T>(),
      })?;
    match (self.splitter)(value) {
      Some(index) => {
        let width = self.outputs.len();
        self.outputs[index % width].emit(tuple).await
      }
      None => Ok(()),
    }
  }
}

/// Forwards tuples from any input port to the single output.
#[derive(Default)]
pub struct Union {
  emitter: Option<Emitter>,
}

impl Union {
  /// Creates the oplet.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Oplet for Union {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process_port(&mut self, _port: usize, tuple: Tuple) -> Result<(), OpletError> {
    match &self.emitter {
      Some(emitter) => emitter.emit(tuple).await,
      None => Err(OpletError::NotInitialized("union".to_string())),
    }
  }
}

/// Hook told which input queue a tuple was taken from.
pub type ConsumedHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Joins its inputs index by index.
///
/// Each input port has a FIFO queue. Once every queue holds a tuple, the
/// heads are removed and emitted as one `Vec` ordered by port. The
/// `on_consumed` hook is called for every removed head; it is how upstream
/// gates learn that a slot was freed.
pub struct Barrier<T> {
  queues: Vec<VecDeque<Tuple>>,
  on_consumed: Option<ConsumedHook>,
  name: String,
  emitter: Option<Emitter>,
  _type: PhantomData<fn(T)>,
}

impl<T: TupleData> Barrier<T> {
  /// Creates a barrier over `width` inputs.
  pub fn new(width: usize, on_consumed: Option<ConsumedHook>) -> Self {
    Self {
      queues: (0..width).map(|_| VecDeque::new()).collect(),
      on_consumed,
      name: String::new(),
      emitter: None,
      _type: PhantomData,
    }
  }
}

#[async_trait]
impl<T: TupleData> Oplet for Barrier<T> {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process_port(&mut self, port: usize, tuple: Tuple) -> Result<(), OpletError> {
    let queue = self
      .queues
      .get_mut(port)
      .ok_or_else(|| OpletError::NoSuchInput {
        oplet: self.name.clone(),
        port,
      })?;
    queue.push_back(tuple);

    if self.queues.iter().any(VecDeque::is_empty) {
      return Ok(());
    }
    let mut joined = Vec::with_capacity(self.queues.len());
    for (index, queue) in self.queues.iter_mut().enumerate() {
      if let Some(head) = queue.pop_front() {
        joined.push(from_tuple::<T>(head)?);
      }
      if let Some(hook) = &self.on_consumed {
        hook(index);
      }
    }
    match &self.emitter {
      Some(emitter) => emitter.emit_value(joined).await,
      None => Err(OpletError::NotInitialized(self.name.clone())),
    }
  }
}

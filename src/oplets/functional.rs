//! Oplets built from plain closures: transforms, peeks, sinks and fallible
//! transforms governed by an [`ErrorStrategy`].

use crate::error::{
  BoxError, ComponentInfo, ErrorAction, ErrorContext, ErrorStrategy, OpletError, StreamError,
  StringError,
};
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData, from_tuple};
use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::{debug, warn};

fn emitter<'a>(emitter: &'a Option<Emitter>, name: &str) -> Result<&'a Emitter, OpletError> {
  emitter
    .as_ref()
    .ok_or_else(|| OpletError::NotInitialized(name.to_string()))
}

/// Applies a function to each tuple and forwards the `Some` results.
///
/// `map`, `filter` and `modify` are all expressed through this oplet.
pub struct FilterMap<I, O, F> {
  f: F,
  name: String,
  emitter: Option<Emitter>,
  _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FilterMap<I, O, F>
where
  I: TupleData,
  O: TupleData,
  F: FnMut(I) -> Option<O> + Send + 'static,
{
  /// Creates the oplet.
  pub fn new(f: F) -> Self {
    Self {
      f,
      name: String::new(),
      emitter: None,
      _types: PhantomData,
    }
  }
}

#[async_trait]
impl<I, O, F> Oplet for FilterMap<I, O, F>
where
  I: TupleData,
  O: TupleData,
  F: FnMut(I) -> Option<O> + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let value = from_tuple::<I>(tuple)?;
    match (self.f)(value) {
      Some(output) => emitter(&self.emitter, &self.name)?.emit_value(output).await,
      None => Ok(()),
    }
  }
}

/// Calls a function with a reference to each tuple, then forwards the tuple
/// unchanged.
pub struct Peek<T, F> {
  f: F,
  name: String,
  emitter: Option<Emitter>,
  _type: PhantomData<fn(T)>,
}

impl<T, F> Peek<T, F>
where
  T: TupleData,
  F: FnMut(&T) + Send + 'static,
{
  /// Creates the oplet.
  pub fn new(f: F) -> Self {
    Self {
      f,
      name: String::new(),
      emitter: None,
      _type: PhantomData,
    }
  }
}

#[async_trait]
impl<T, F> Oplet for Peek<T, F>
where
  T: TupleData,
  F: FnMut(&T) + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let value = tuple
      .downcast_ref::<T>()
      .ok_or(OpletError::TypeMismatch {
        expected: std::any::type_name::<T>(),
      })?;
    (self.f)(value);
    emitter(&self.emitter, &self.name)?.emit(tuple).await
  }
}

/// Terminal oplet consuming every tuple.
pub struct Sink<T, F> {
  f: F,
  _type: PhantomData<fn(T)>,
}

impl<T, F> Sink<T, F>
where
  T: TupleData,
  F: FnMut(T) + Send + 'static,
{
  /// Creates the oplet.
  pub fn new(f: F) -> Self {
    Self {
      f,
      _type: PhantomData,
    }
  }
}

#[async_trait]
impl<T, F> Oplet for Sink<T, F>
where
  T: TupleData,
  F: FnMut(T) + Send + 'static,
{
  async fn initialize(&mut self, _ctx: OpletContext) -> Result<(), OpletError> {
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    (self.f)(from_tuple::<T>(tuple)?);
    Ok(())
  }
}

/// Applies a fallible function and consults an [`ErrorStrategy`] when it
/// fails.
///
/// - `Stop` fails the task delivering the tuple, which stops the job.
/// - `Skip` logs the error and drops the tuple.
/// - `Retry(n)` calls the function again with the same tuple up to `n` times.
pub struct TryMap<I, O, E, F> {
  f: F,
  strategy: ErrorStrategy<I>,
  component: ComponentInfo,
  emitter: Option<Emitter>,
  _types: PhantomData<fn(I) -> Result<O, E>>,
}

impl<I, O, E, F> TryMap<I, O, E, F>
where
  I: TupleData,
  O: TupleData,
  E: Into<BoxError> + Send + 'static,
  F: FnMut(I) -> Result<O, E> + Send + 'static,
{
  /// Creates the oplet.
  pub fn new(f: F, strategy: ErrorStrategy<I>) -> Self {
    Self {
      f,
      strategy,
      component: ComponentInfo::new("try_map", "TryMap"),
      emitter: None,
      _types: PhantomData,
    }
  }
}

#[async_trait]
impl<I, O, E, F> Oplet for TryMap<I, O, E, F>
where
  I: TupleData,
  O: TupleData,
  E: Into<BoxError> + Send + 'static,
  F: FnMut(I) -> Result<O, E> + Send + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.component.name = ctx.name().to_string();
    self.emitter = Some(ctx.emitter());
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let value = from_tuple::<I>(tuple)?;
    let mut retries = 0;
    loop {
      let source = match (self.f)(value.clone()) {
        Ok(output) => {
          return emitter(&self.emitter, &self.component.name)?
            .emit_value(output)
            .await;
        }
        Err(err) => err.into(),
      };
      let mut error = StreamError::new(
        source,
        ErrorContext::now(Some(value.clone()), &self.component),
        self.component.clone(),
      );
      error.retries = retries;
      match self.strategy.action_for(&error) {
        ErrorAction::Retry => {
          debug!(component = %self.component.name, retries, "retrying tuple");
          retries += 1;
        }
        ErrorAction::Skip => {
          warn!(component = %self.component.name, error = %error, "skipping tuple");
          return Ok(());
        }
        ErrorAction::Stop => return Err(StringError::from(error).into()),
      }
    }
  }
}

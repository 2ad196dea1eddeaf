//! Bounded, drop-oldest buffering between a fast producer and a slow consumer.

use crate::error::{GraphError, OpletError};
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData};
use crate::scheduler::{TaskHandle, TrackingScheduler};
use crate::topology::Stream;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Relieves back pressure from `stream` by keeping at most `capacity`
/// unconsumed tuples per partition, dropping the oldest when a new one
/// arrives.
///
/// A tuple arriving while the consumer is idle is handed over directly and is
/// never dropped. So with a single partition, `capacity` 3 and input
/// `A..H` arriving faster than they drain, the delivered sequence is
/// `A, F, G, H`.
///
/// `partitioner` must be a pure function of the tuple. Use `|_| ()` for a
/// single partition.
pub fn pressure_reliever<T, K, F>(
  stream: &Stream<T>,
  partitioner: F,
  capacity: usize,
) -> Result<Stream<T>, GraphError>
where
  T: TupleData,
  K: Eq + Hash + Clone + Send + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  stream.pipe(
    "pressure_reliever",
    PressureReliever::new(partitioner, capacity.max(1)),
  )
}

struct RelieverState<K> {
  queues: HashMap<K, VecDeque<Tuple>>,
  /// Partitions with queued tuples, in the order they are served.
  ready: VecDeque<K>,
  handoff: Option<Tuple>,
  idle: bool,
  closed: bool,
}

struct Shared<K> {
  state: Mutex<RelieverState<K>>,
  wake: Notify,
}

impl<K: Eq + Hash + Clone> Shared<K> {
  fn lock(&self) -> std::sync::MutexGuard<'_, RelieverState<K>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Takes the next tuple for the consumer, or marks it idle.
  fn next(&self) -> Option<Tuple> {
    let mut state = self.lock();
    if let Some(tuple) = state.handoff.take() {
      return Some(tuple);
    }
    while let Some(key) = state.ready.pop_front() {
      let Some(queue) = state.queues.get_mut(&key) else {
        continue;
      };
      let tuple = queue.pop_front();
      if queue.is_empty() {
        state.queues.remove(&key);
      } else {
        state.ready.push_back(key);
      }
      if tuple.is_some() {
        return tuple;
      }
    }
    state.idle = true;
    None
  }
}

/// Oplet behind [`pressure_reliever`].
pub struct PressureReliever<T, K, F> {
  partitioner: F,
  capacity: usize,
  shared: Arc<Shared<K>>,
  name: String,
  task: Option<TaskHandle>,
  ctx: Option<(Emitter, TrackingScheduler)>,
  _type: PhantomData<fn(T)>,
}

impl<T, K, F> PressureReliever<T, K, F>
where
  T: TupleData,
  K: Eq + Hash + Clone + Send + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  /// Creates the oplet.
  pub fn new(partitioner: F, capacity: usize) -> Self {
    Self {
      partitioner,
      capacity,
      shared: Arc::new(Shared {
        state: Mutex::new(RelieverState {
          queues: HashMap::new(),
          ready: VecDeque::new(),
          handoff: None,
          idle: true,
          closed: false,
        }),
        wake: Notify::new(),
      }),
      name: String::new(),
      task: None,
      ctx: None,
      _type: PhantomData,
    }
  }
}

#[async_trait]
impl<T, K, F> Oplet for PressureReliever<T, K, F>
where
  T: TupleData,
  K: Eq + Hash + Clone + Send + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.ctx = Some((ctx.emitter(), ctx.scheduler().clone()));
    Ok(())
  }

  async fn start(&mut self) -> Result<(), OpletError> {
    let (emitter, scheduler) = self
      .ctx
      .take()
      .ok_or_else(|| OpletError::NotInitialized(self.name.clone()))?;
    let shared = Arc::clone(&self.shared);
    self.task = Some(scheduler.submit(format!("{}.drain", self.name), async move {
      loop {
        match shared.next() {
          Some(tuple) => emitter.emit(tuple).await?,
          None => {
            if shared.lock().closed {
              return Ok(());
            }
            shared.wake.notified().await;
          }
        }
      }
    }));
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let key = {
      let value = tuple
        .downcast_ref::<T>()
        .ok_or(OpletError::TypeMismatch {
          expected: std::any::type_name::<T>(),
        })?;
      (self.partitioner)(value)
    };

    let mut state = self.shared.lock();
    if state.idle && state.handoff.is_none() {
      state.idle = false;
      state.handoff = Some(tuple);
    } else {
      let capacity = self.capacity;
      let queue = state.queues.entry(key.clone()).or_default();
      let was_empty = queue.is_empty();
      if queue.len() >= capacity {
        queue.pop_front();
        debug!(oplet = %self.name, capacity, "dropped oldest queued tuple");
      }
      queue.push_back(tuple);
      if was_empty {
        state.ready.push_back(key);
      }
    }
    drop(state);
    self.shared.wake.notify_one();
    Ok(())
  }

  async fn close(&mut self) -> Result<(), OpletError> {
    self.shared.lock().closed = true;
    self.shared.wake.notify_one();
    if let Some(task) = self.task.take() {
      task.cancel(true);
    }
    Ok(())
  }
}

//! Hand-off between a producer and independently running consumers.

use crate::error::{GraphError, OpletError};
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData};
use crate::scheduler::TrackingScheduler;
use crate::topology::Stream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Called after a drain worker finished delivering one tuple downstream.
pub(crate) type DeliveredHook = Arc<dyn Fn() + Send + Sync>;

/// Decouples downstream processing from the producer of `stream`.
///
/// Tuples go through a bounded queue of `isolate_queue_capacity` and are
/// delivered by separate tasks, so the producer only waits when the queue is
/// full. In ordered mode a single task delivers in arrival order. Otherwise
/// `unordered_isolate_workers` tasks take tuples off the queue and order is
/// not kept. The workers only overlap the queue hand-off: downstream oplets
/// still process one tuple at a time, so delivery stays serialized.
pub fn isolate<T: TupleData>(stream: &Stream<T>, ordered: bool) -> Result<Stream<T>, GraphError> {
  let config = stream.topology().plumbing();
  let workers = if ordered {
    1
  } else {
    config.unordered_isolate_workers
  };
  isolate_with(stream, config.isolate_queue_capacity, workers, None)
}

pub(crate) fn isolate_with<T: TupleData>(
  stream: &Stream<T>,
  capacity: usize,
  workers: usize,
  on_delivered: Option<DeliveredHook>,
) -> Result<Stream<T>, GraphError> {
  stream.pipe(
    "isolate",
    Isolate::new(capacity.max(1), workers.max(1), on_delivered),
  )
}

struct Wiring {
  name: String,
  emitter: Emitter,
  scheduler: TrackingScheduler,
  receiver: mpsc::Receiver<Tuple>,
}

/// Oplet behind [`isolate`].
pub struct Isolate {
  capacity: usize,
  workers: usize,
  on_delivered: Option<DeliveredHook>,
  sender: Option<mpsc::Sender<Tuple>>,
  wiring: Option<Wiring>,
  name: String,
}

impl Isolate {
  fn new(capacity: usize, workers: usize, on_delivered: Option<DeliveredHook>) -> Self {
    Self {
      capacity,
      workers,
      on_delivered,
      sender: None,
      wiring: None,
      name: String::new(),
    }
  }
}

async fn deliver(
  emitter: &Emitter,
  tuple: Tuple,
  on_delivered: &Option<DeliveredHook>,
) -> Result<(), OpletError> {
  let _delivered = scopeguard::guard((), |_| {
    if let Some(hook) = on_delivered {
      hook();
    }
  });
  emitter.emit(tuple).await
}

#[async_trait]
impl Oplet for Isolate {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    let (sender, receiver) = mpsc::channel(self.capacity);
    self.name = ctx.name().to_string();
    self.sender = Some(sender);
    self.wiring = Some(Wiring {
      name: ctx.name().to_string(),
      emitter: ctx.emitter(),
      scheduler: ctx.scheduler().clone(),
      receiver,
    });
    Ok(())
  }

  async fn start(&mut self) -> Result<(), OpletError> {
    let Wiring {
      name,
      emitter,
      scheduler,
      mut receiver,
    } = self
      .wiring
      .take()
      .ok_or_else(|| OpletError::NotInitialized(self.name.clone()))?;

    if self.workers == 1 {
      let on_delivered = self.on_delivered.clone();
      scheduler.submit(format!("{name}.drain"), async move {
        while let Some(tuple) = receiver.recv().await {
          deliver(&emitter, tuple, &on_delivered).await?;
        }
        Ok(())
      });
      return Ok(());
    }

    let receiver = Arc::new(Mutex::new(receiver));
    for worker in 0..self.workers {
      let receiver = Arc::clone(&receiver);
      let emitter = emitter.clone();
      let on_delivered = self.on_delivered.clone();
      scheduler.submit(format!("{name}.drain-{worker}"), async move {
        loop {
          let next = receiver.lock().await.recv().await;
          match next {
            Some(tuple) => deliver(&emitter, tuple, &on_delivered).await?,
            None => return Ok(()),
          }
        }
      });
    }
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    let sender = self
      .sender
      .as_ref()
      .ok_or_else(|| OpletError::NotInitialized(self.name.clone()))?;
    sender
      .send(tuple)
      .await
      .map_err(|_| OpletError::Closed(self.name.clone()))
  }

  async fn close(&mut self) -> Result<(), OpletError> {
    self.sender = None;
    Ok(())
  }
}

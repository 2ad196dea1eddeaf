//! Partitioned fan-out: every tuple runs through exactly one channel.

use crate::error::{GraphError, OpletError};
use crate::graph::VertexKind;
use crate::oplet::{Emitter, Oplet, OpletContext, Tuple, TupleData};
use crate::plumbing::isolate::{DeliveredHook, isolate_with};
use crate::topology::Stream;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tracing::trace;

/// Runs tuples of `stream` through `width` instances of a pipeline, one
/// channel per instance.
///
/// Each tuple goes to channel `splitter(&tuple, width) % width`. Every
/// channel has its own queue of `parallel_channel_capacity` and its own
/// task, so order is kept within a channel but not across channels. The
/// channel outputs are merged in completion order.
///
/// `pipeline` is called once per channel with the channel's stream and index.
pub fn parallel<T, U, S, P>(
  stream: &Stream<T>,
  width: usize,
  splitter: S,
  pipeline: P,
) -> Result<Stream<U>, GraphError>
where
  T: TupleData,
  U: TupleData,
  S: Fn(&T, usize) -> usize + Send + 'static,
  P: Fn(&Stream<T>, usize) -> Result<Stream<U>, GraphError>,
{
  if width == 0 {
    return Err(GraphError::ZeroWidth("parallel"));
  }
  let capacity = stream.topology().plumbing().parallel_channel_capacity;
  let channels = stream.split(width, move |value| Some(splitter(value, width)))?;
  let results = channels
    .iter()
    .enumerate()
    .map(|(index, channel)| {
      let isolated = isolate_with(channel, capacity, 1, None)?;
      pipeline(&isolated, index)
    })
    .collect::<Result<Vec<_>, _>>()?;
  stream.topology().union(&results)
}

/// [`parallel`] where every channel applies `mapper`, which also receives the
/// channel index.
pub fn parallel_map<T, U, S, M>(
  stream: &Stream<T>,
  width: usize,
  splitter: S,
  mapper: M,
) -> Result<Stream<U>, GraphError>
where
  T: TupleData,
  U: TupleData,
  S: Fn(&T, usize) -> usize + Send + 'static,
  M: Fn(T, usize) -> U + Send + Sync + 'static,
{
  let mapper = Arc::new(mapper);
  parallel(stream, width, splitter, move |channel, index| {
    let mapper = Arc::clone(&mapper);
    channel.map(move |value| mapper(value, index))
  })
}

/// Like [`parallel`], but each tuple goes to the channel with the least
/// outstanding work.
///
/// A tuple counts as outstanding from dispatch until its channel pipeline
/// has finished with it. Each channel holds at most `balanced_channel_depth`
/// outstanding tuples; when every channel is full the producer waits. Ties
/// between equally loaded channels are broken round-robin, starting after the
/// channel picked last.
pub fn parallel_balanced<T, U, P>(
  stream: &Stream<T>,
  width: usize,
  pipeline: P,
) -> Result<Stream<U>, GraphError>
where
  T: TupleData,
  U: TupleData,
  P: Fn(&Stream<T>, usize) -> Result<Stream<U>, GraphError>,
{
  if width == 0 {
    return Err(GraphError::ZeroWidth("parallel_balanced"));
  }
  let depth = stream.topology().plumbing().balanced_channel_depth.max(1);
  let load = Arc::new(ChannelLoad::new(width, depth));

  let topology = stream.topology().clone();
  let outputs = {
    let mut graph = topology.graph();
    let vertex = graph.add_vertex(
      "parallel_balanced",
      VertexKind::Split,
      Box::new(BalancedSplit::new(Arc::clone(&load))),
      1,
      width,
    )?;
    graph.connect(stream.id(), vertex, 0)?;
    (0..width)
      .map(|port| graph.output(vertex, port))
      .collect::<Result<Vec<_>, _>>()?
  };

  let results = outputs
    .into_iter()
    .enumerate()
    .map(|(index, id)| {
      let channel = topology.stream::<T>(id);
      let load = Arc::clone(&load);
      let hook: DeliveredHook = Arc::new(move || load.release(index));
      let isolated = isolate_with(&channel, depth, 1, Some(hook))?;
      pipeline(&isolated, index)
    })
    .collect::<Result<Vec<_>, _>>()?;
  topology.union(&results)
}

/// Outstanding-work bookkeeping shared by the dispatcher and the channels.
struct ChannelLoad {
  permits: Semaphore,
  state: Mutex<LoadState>,
}

struct LoadState {
  outstanding: Vec<usize>,
  cursor: usize,
}

impl ChannelLoad {
  fn new(width: usize, depth: usize) -> Self {
    Self {
      permits: Semaphore::new(width * depth),
      state: Mutex::new(LoadState {
        outstanding: vec![0; width],
        cursor: 0,
      }),
    }
  }

  /// Picks the least loaded channel and charges it one tuple.
  fn claim(&self) -> usize {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let width = state.outstanding.len();
    let start = state.cursor;
    let mut best = start;
    for offset in 1..width {
      let candidate = (start + offset) % width;
      if state.outstanding[candidate] < state.outstanding[best] {
        best = candidate;
      }
    }
    state.outstanding[best] += 1;
    state.cursor = (best + 1) % width;
    best
  }

  fn release(&self, channel: usize) {
    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      state.outstanding[channel] = state.outstanding[channel].saturating_sub(1);
    }
    self.permits.add_permits(1);
  }

  #[cfg(test)]
  fn outstanding(&self) -> Vec<usize> {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .outstanding
      .clone()
  }
}

/// Dispatcher behind [`parallel_balanced`].
struct BalancedSplit {
  load: Arc<ChannelLoad>,
  outputs: Vec<Emitter>,
  name: String,
}

impl BalancedSplit {
  fn new(load: Arc<ChannelLoad>) -> Self {
    Self {
      load,
      outputs: Vec::new(),
      name: String::new(),
    }
  }
}

#[async_trait]
impl Oplet for BalancedSplit {
  async fn initialize(&mut self, ctx: OpletContext) -> Result<(), OpletError> {
    self.name = ctx.name().to_string();
    self.outputs = (0..ctx.output_count())
      .filter_map(|port| ctx.output(port))
      .collect();
    Ok(())
  }

  async fn process(&mut self, tuple: Tuple) -> Result<(), OpletError> {
    self
      .load
      .permits
      .acquire()
      .await
      .map_err(|_| OpletError::Closed(self.name.clone()))?
      .forget();
    let channel = self.load.claim();
    trace!(oplet = %self.name, channel, "dispatching tuple");
    match self.outputs.get(channel) {
      Some(emitter) => emitter.emit(tuple).await,
      None => Err(OpletError::NotInitialized(self.name.clone())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_claim_prefers_least_loaded() {
    let load = ChannelLoad::new(3, 2);
    assert_eq!(load.claim(), 0);
    assert_eq!(load.claim(), 1);
    assert_eq!(load.claim(), 2);
    load.release(1);
    assert_eq!(load.claim(), 1);
    assert_eq!(load.outstanding(), vec![1, 1, 1]);
  }

  #[test]
  fn test_ties_rotate_from_last_pick() {
    let load = ChannelLoad::new(3, 4);
    let picks: Vec<usize> = (0..6).map(|_| load.claim()).collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
  }

  #[test]
  fn test_release_returns_permit() {
    let load = ChannelLoad::new(2, 1);
    assert_eq!(load.permits.available_permits(), 2);
    load.permits.try_acquire().unwrap().forget();
    let channel = load.claim();
    assert_eq!(load.permits.available_permits(), 1);
    load.release(channel);
    assert_eq!(load.permits.available_permits(), 2);
    assert_eq!(load.outstanding(), vec![0, 0]);
  }
}

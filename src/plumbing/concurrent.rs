//! Broadcast-join fan-out: every tuple runs through every channel.

use crate::error::GraphError;
use crate::oplet::TupleData;
use crate::plumbing::isolate::isolate_with;
use crate::topology::Stream;
use std::sync::Arc;

/// Builds one channel of a [`concurrent`] fan-out.
pub type Pipeline<T, U> = Box<dyn FnOnce(&Stream<T>) -> Result<Stream<U>, GraphError>>;

/// A function run by one channel of a [`concurrent_map`] fan-out.
pub type Mapper<T, U> = Arc<dyn Fn(T) -> U + Send + Sync>;

/// Runs every tuple of `stream` through all `pipelines` concurrently and
/// combines the per-channel results into one output tuple.
///
/// For input `v` the combiner receives
/// `[result(channel 0, v), .., result(channel W-1, v)]` and outputs leave in
/// input order. Each channel runs on its own task behind a queue of
/// `concurrent_channel_capacity`; a channel may run at most
/// `barrier_queue_capacity` results ahead of the slowest channel.
///
/// Every pipeline must produce exactly one result per input tuple.
pub fn concurrent<T, U, R, C>(
  stream: &Stream<T>,
  pipelines: Vec<Pipeline<T, U>>,
  combiner: C,
) -> Result<Stream<R>, GraphError>
where
  T: TupleData,
  U: TupleData,
  R: TupleData,
  C: FnMut(Vec<U>) -> R + Send + 'static,
{
  if pipelines.is_empty() {
    return Err(GraphError::ZeroWidth("concurrent"));
  }
  let config = stream.topology().plumbing().clone();
  let results = pipelines
    .into_iter()
    .map(|pipeline| {
      let channel = isolate_with(stream, config.concurrent_channel_capacity, 1, None)?;
      pipeline(&channel)
    })
    .collect::<Result<Vec<_>, _>>()?;
  stream
    .topology()
    .barrier_with_capacity(&results, config.barrier_queue_capacity)?
    .map(combiner)
}

/// [`concurrent`] where each channel applies one mapper function.
pub fn concurrent_map<T, U, R, C>(
  stream: &Stream<T>,
  mappers: Vec<Mapper<T, U>>,
  combiner: C,
) -> Result<Stream<R>, GraphError>
where
  T: TupleData,
  U: TupleData,
  R: TupleData,
  C: FnMut(Vec<U>) -> R + Send + 'static,
{
  let pipelines = mappers
    .into_iter()
    .map(|mapper| -> Pipeline<T, U> {
      Box::new(move |channel: &Stream<T>| channel.map(move |value| mapper(value)))
    })
    .collect();
  concurrent(stream, pipelines, combiner)
}

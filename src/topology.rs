//! # Topology
//!
//! A [`Topology`] is the application-facing builder around a [`Graph`]. Sources
//! are added to the topology and return typed [`Stream`] handles; each stream
//! operation appends an oplet to the graph and returns the new stream.
//!
//! ```rust
//! use edgeflow::topology::Topology;
//!
//! # fn main() -> Result<(), edgeflow::error::GraphError> {
//! let topology = Topology::new("readings");
//! let celsius = topology.of(vec![12.5f64, 19.0, 31.5])?;
//! let alerts = celsius
//!   .filter(|c| *c > 30.0)?
//!   .map(|c| format!("hot: {c}"))?;
//! alerts.sink(|line| println!("{line}"))?;
//! assert_eq!(topology.vertex_count(), 4);
//! # Ok(())
//! # }
//! ```
//!
//! All builder methods take `&self`; a topology is a cheap shared handle and
//! every stream keeps one. Once the topology is submitted its graph is
//! frozen and further builder calls fail with [`GraphError::Finalized`].

use crate::config::PlumbingConfig;
use crate::error::{BoxError, ErrorStrategy, GraphError};
use crate::graph::{Graph, Stage, StreamId, VertexId, VertexKind, topological_sort};
use crate::oplet::{Oplet, TupleData};
use crate::oplets::{
  Barrier, ConsumedHook, EventSource, FilterMap, IterSource, Peek, PollSource, Sink, Split,
  Submitter, TryMap, Union,
};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct TopologyInner {
  name: String,
  config: PlumbingConfig,
  graph: Mutex<Graph>,
}

/// A named graph of streams under construction.
#[derive(Clone)]
pub struct Topology {
  inner: Arc<TopologyInner>,
}

impl fmt::Debug for Topology {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Topology")
      .field("name", &self.inner.name)
      .field("vertices", &self.vertex_count())
      .finish()
  }
}

impl Topology {
  /// Creates an empty topology with the default plumbing configuration.
  pub fn new(name: impl Into<String>) -> Self {
    Self::with_config(name, PlumbingConfig::default())
  }

  /// Creates an empty topology using `config` for plumbing defaults.
  pub fn with_config(name: impl Into<String>, config: PlumbingConfig) -> Self {
    let name = name.into();
    Self {
      inner: Arc::new(TopologyInner {
        graph: Mutex::new(Graph::new(name.clone())),
        name,
        config,
      }),
    }
  }

  /// Name of the topology.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Plumbing defaults used by operators added to this topology.
  pub fn plumbing(&self) -> &PlumbingConfig {
    &self.inner.config
  }

  /// Number of oplets added so far.
  pub fn vertex_count(&self) -> usize {
    self.graph().vertex_count()
  }

  /// Runs `f` with read access to the underlying graph.
  pub fn with_graph<R>(&self, f: impl FnOnce(&Graph) -> R) -> R {
    f(&self.graph())
  }

  pub(crate) fn graph(&self) -> MutexGuard<'_, Graph> {
    self
      .inner
      .graph
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Freezes the graph and returns its stages together with a topological
  /// order of their ids.
  pub(crate) fn finalize(&self) -> Result<(Vec<Stage>, Vec<VertexId>), GraphError> {
    let mut graph = self.graph();
    let order = topological_sort(&graph);
    let stages = graph.finalize()?;
    Ok((stages, order))
  }

  pub(crate) fn stream<T: TupleData>(&self, id: StreamId) -> Stream<T> {
    Stream {
      topology: self.clone(),
      id,
      _type: PhantomData,
    }
  }

  /// Adds a custom source oplet.
  pub fn source_with<T, O>(&self, name: impl Into<String>, oplet: O) -> Result<Stream<T>, GraphError>
  where
    T: TupleData,
    O: Oplet,
  {
    let id = self.graph().add_source(name, Box::new(oplet))?;
    Ok(self.stream(id))
  }

  /// Emits every item of `iter` once the job starts. Endless iterators are
  /// fine.
  pub fn source<T, I>(&self, iter: I) -> Result<Stream<T>, GraphError>
  where
    T: TupleData,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
  {
    self.source_with("source", IterSource::new(iter.into_iter()))
  }

  /// Emits the given values in order.
  pub fn of<T: TupleData>(&self, values: impl IntoIterator<Item = T>) -> Result<Stream<T>, GraphError> {
    let values: Vec<T> = values.into_iter().collect();
    self.source_with("of", IterSource::new(values.into_iter()))
  }

  /// Emits the given strings in order.
  pub fn strings<S: Into<String>>(
    &self,
    values: impl IntoIterator<Item = S>,
  ) -> Result<Stream<String>, GraphError> {
    self.of(values.into_iter().map(Into::into).collect::<Vec<String>>())
  }

  /// Emits values from `supplier` endlessly, as fast as downstream accepts
  /// them.
  pub fn generate<T, F>(&self, supplier: F) -> Result<Stream<T>, GraphError>
  where
    T: TupleData,
    F: FnMut() -> T + Send + 'static,
  {
    self.source_with("generate", IterSource::new(std::iter::repeat_with(supplier)))
  }

  /// Calls `supplier` every `period`, emitting the `Some` results.
  pub fn poll<T, F>(&self, supplier: F, period: Duration) -> Result<Stream<T>, GraphError>
  where
    T: TupleData,
    F: FnMut() -> Option<T> + Send + 'static,
  {
    self.source_with("poll", PollSource::new(supplier, period))
  }

  /// Event-driven source. `setup` is called once when the job starts and
  /// may hand the [`Submitter`] to any thread.
  pub fn events<T, F>(&self, setup: F) -> Result<Stream<T>, GraphError>
  where
    T: TupleData,
    F: FnOnce(Submitter<T>) + Send + 'static,
  {
    self.source_with("events", EventSource::new(setup))
  }

  /// Merges several streams into one, in arrival order.
  pub fn union<T: TupleData>(&self, streams: &[Stream<T>]) -> Result<Stream<T>, GraphError> {
    self.check_owned(streams)?;
    match streams {
      [] => Err(GraphError::ZeroWidth("union")),
      [single] => Ok(single.clone()),
      _ => {
        let id = self.add_fan_in("union", Box::new(Union::new()), streams)?;
        Ok(self.stream(id))
      }
    }
  }

  /// Joins several streams index by index.
  ///
  /// Emits `[s0[i], s1[i], ..]` once every input has delivered its `i`-th
  /// tuple. No input may run more than `barrier_queue_capacity` tuples ahead
  /// of the slowest one; a stream that is further ahead is held back.
  pub fn barrier<T: TupleData>(&self, streams: &[Stream<T>]) -> Result<Stream<Vec<T>>, GraphError> {
    self.barrier_with_capacity(streams, self.inner.config.barrier_queue_capacity)
  }

  pub(crate) fn barrier_with_capacity<T: TupleData>(
    &self,
    streams: &[Stream<T>],
    capacity: usize,
  ) -> Result<Stream<Vec<T>>, GraphError> {
    if streams.is_empty() {
      return Err(GraphError::ZeroWidth("barrier"));
    }
    self.check_owned(streams)?;
    let permits: Vec<_> = streams
      .iter()
      .map(|_| Arc::new(tokio::sync::Semaphore::new(capacity.max(1))))
      .collect();
    let gated = streams
      .iter()
      .zip(&permits)
      .map(|(stream, semaphore)| crate::plumbing::gate(stream, Arc::clone(semaphore)))
      .collect::<Result<Vec<_>, _>>()?;
    let release: ConsumedHook = Arc::new(move |index: usize| permits[index].add_permits(1));
    let barrier = Barrier::<T>::new(streams.len(), Some(release));
    let id = self.add_fan_in("barrier", Box::new(barrier), &gated)?;
    Ok(self.stream(id))
  }

  fn check_owned<T>(&self, streams: &[Stream<T>]) -> Result<(), GraphError> {
    match streams
      .iter()
      .find(|stream| !Arc::ptr_eq(&stream.topology.inner, &self.inner))
    {
      Some(foreign) => Err(GraphError::ForeignStream(foreign.id)),
      None => Ok(()),
    }
  }

  fn add_fan_in<T: TupleData>(
    &self,
    name: &str,
    oplet: Box<dyn Oplet>,
    inputs: &[Stream<T>],
  ) -> Result<StreamId, GraphError> {
    self.check_owned(inputs)?;
    let mut graph = self.graph();
    for input in inputs {
      if graph.producer(input.id).is_none() {
        return Err(GraphError::UnknownStream(input.id));
      }
    }
    let vertex = graph.add_vertex(name, VertexKind::FanIn, oplet, inputs.len(), 1)?;
    for (port, input) in inputs.iter().enumerate() {
      graph.connect(input.id, vertex, port)?;
    }
    graph.output(vertex, 0)
  }
}

/// A typed handle to one stream of a topology.
pub struct Stream<T> {
  topology: Topology,
  id: StreamId,
  _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Stream<T> {
  fn clone(&self) -> Self {
    Self {
      topology: self.topology.clone(),
      id: self.id,
      _type: PhantomData,
    }
  }
}

impl<T> fmt::Debug for Stream<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stream")
      .field("topology", &self.topology.name())
      .field("id", &self.id)
      .field("type", &std::any::type_name::<T>())
      .finish()
  }
}

impl<T: TupleData> Stream<T> {
  /// Id of the stream in its graph.
  pub fn id(&self) -> StreamId {
    self.id
  }

  /// The topology the stream belongs to.
  pub fn topology(&self) -> &Topology {
    &self.topology
  }

  /// Appends a custom one-in, one-out oplet.
  pub fn pipe<U, O>(&self, name: impl Into<String>, oplet: O) -> Result<Stream<U>, GraphError>
  where
    U: TupleData,
    O: Oplet,
  {
    let id = self
      .topology
      .graph()
      .add_transform(name, Box::new(oplet), self.id)?;
    Ok(self.topology.stream(id))
  }

  /// Terminates the stream with a custom oplet.
  pub fn sink_with<O: Oplet>(&self, name: impl Into<String>, oplet: O) -> Result<VertexId, GraphError> {
    self
      .topology
      .graph()
      .add_sink(name, Box::new(oplet), self.id)
  }

  /// Transforms every tuple.
  pub fn map<U, F>(&self, mut f: F) -> Result<Stream<U>, GraphError>
  where
    U: TupleData,
    F: FnMut(T) -> U + Send + 'static,
  {
    self.pipe("map", FilterMap::new(move |value| Some(f(value))))
  }

  /// Transforms every tuple, dropping the `None` results.
  pub fn filter_map<U, F>(&self, f: F) -> Result<Stream<U>, GraphError>
  where
    U: TupleData,
    F: FnMut(T) -> Option<U> + Send + 'static,
  {
    self.pipe("filter_map", FilterMap::new(f))
  }

  /// Keeps the tuples matching `predicate`.
  pub fn filter<F>(&self, mut predicate: F) -> Result<Stream<T>, GraphError>
  where
    F: FnMut(&T) -> bool + Send + 'static,
  {
    self.pipe(
      "filter",
      FilterMap::new(move |value| predicate(&value).then_some(value)),
    )
  }

  /// Replaces every tuple with a value of the same type.
  pub fn modify<F>(&self, mut f: F) -> Result<Stream<T>, GraphError>
  where
    F: FnMut(T) -> T + Send + 'static,
  {
    self.pipe("modify", FilterMap::new(move |value| Some(f(value))))
  }

  /// Observes every tuple without changing the stream.
  pub fn peek<F>(&self, f: F) -> Result<Stream<T>, GraphError>
  where
    F: FnMut(&T) + Send + 'static,
  {
    self.pipe("peek", Peek::new(f))
  }

  /// Consumes every tuple.
  pub fn sink<F>(&self, f: F) -> Result<VertexId, GraphError>
  where
    F: FnMut(T) + Send + 'static,
  {
    self.sink_with("sink", Sink::new(f))
  }

  /// Transforms every tuple with a fallible function, handling failures with
  /// `strategy`.
  pub fn try_map<U, E, F>(&self, f: F, strategy: ErrorStrategy<T>) -> Result<Stream<U>, GraphError>
  where
    U: TupleData,
    E: Into<BoxError> + Send + 'static,
    F: FnMut(T) -> Result<U, E> + Send + 'static,
  {
    self.pipe("try_map", TryMap::new(f, strategy))
  }

  /// Splits the stream into `width` streams. Each tuple goes to the stream
  /// at `splitter(tuple) % width`, or is dropped when the splitter returns
  /// `None`.
  pub fn split<F>(&self, width: usize, splitter: F) -> Result<Vec<Stream<T>>, GraphError>
  where
    F: FnMut(&T) -> Option<usize> + Send + 'static,
  {
    if width == 0 {
      return Err(GraphError::ZeroWidth("split"));
    }
    let mut graph = self.topology.graph();
    if graph.producer(self.id).is_none() {
      return Err(GraphError::UnknownStream(self.id));
    }
    let vertex = graph.add_vertex(
      "split",
      VertexKind::Split,
      Box::new(Split::new(splitter)),
      1,
      width,
    )?;
    graph.connect(self.id, vertex, 0)?;
    let outputs = (0..width)
      .map(|port| graph.output(vertex, port))
      .collect::<Result<Vec<_>, _>>()?;
    drop(graph);
    Ok(
      outputs
        .into_iter()
        .map(|id| self.topology.stream(id))
        .collect(),
    )
  }

  /// Decouples downstream processing from the producer of this stream.
  ///
  /// See [`plumbing::isolate`](crate::plumbing::isolate).
  pub fn isolate(&self, ordered: bool) -> Result<Stream<T>, GraphError> {
    crate::plumbing::isolate(self, ordered)
  }
}

//! # Graph
//!
//! The static wiring of a topology, kept as an arena: every vertex (oplet) and
//! every stream gets a stable integer id, and edges are plain id pairs.
//!
//! ## Structure
//!
//! - **Vertex**: one oplet plus its input and output arity.
//! - **Stream**: output port `p` of vertex `v`. Each stream has exactly one
//!   producer and is created together with its vertex.
//! - **Edge**: a stream connected to one input port of a downstream vertex.
//!   A stream may feed any number of edges; every consumer sees every tuple.
//!
//! Every input port accepts exactly one stream, and an edge that would close a
//! cycle is rejected when it is added, so the graph is acyclic by construction.
//!
//! ## Finalization
//!
//! Submitting a topology finalizes its graph: unconnected inputs are reported,
//! the oplets are moved out into runnable stages, and every later mutation
//! fails with [`GraphError::Finalized`].

use crate::error::GraphError;
use crate::oplet::Oplet;
use std::collections::VecDeque;
use std::fmt;

/// Stable id of a vertex within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub(crate) usize);

impl VertexId {
  /// Position of the vertex in the arena.
  pub fn index(&self) -> usize {
    self.0
  }
}

impl fmt::Display for VertexId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "v{}", self.0)
  }
}

/// Stable id of a stream within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) usize);

impl StreamId {
  /// Position of the stream in the arena.
  pub fn index(&self) -> usize {
    self.0
  }
}

impl fmt::Display for StreamId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "s{}", self.0)
  }
}

/// The role a vertex plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
  /// No inputs, one output.
  Source,
  /// One input, one output.
  Transform,
  /// One input, no outputs.
  Sink,
  /// Several inputs, one output.
  FanIn,
  /// One input, several outputs.
  Split,
}

/// A processing stage in the graph.
pub struct Vertex {
  name: String,
  kind: VertexKind,
  inputs: Vec<Option<StreamId>>,
  outputs: Vec<StreamId>,
  oplet: Option<Box<dyn Oplet>>,
}

impl Vertex {
  /// Name given when the vertex was added.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Role of the vertex.
  pub fn kind(&self) -> VertexKind {
    self.kind
  }

  /// Number of input ports.
  pub fn input_arity(&self) -> usize {
    self.inputs.len()
  }

  /// Number of output ports.
  pub fn output_arity(&self) -> usize {
    self.outputs.len()
  }

  /// Stream connected to input `port`, if any.
  pub fn input(&self, port: usize) -> Option<StreamId> {
    self.inputs.get(port).copied().flatten()
  }
}

impl fmt::Debug for Vertex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Vertex")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("inputs", &self.inputs)
      .field("outputs", &self.outputs)
      .finish()
  }
}

#[derive(Debug, Clone, Copy)]
struct StreamSlot {
  producer: VertexId,
  port: usize,
}

/// A connection from a stream to one input port of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
  /// Stream carrying the tuples.
  pub stream: StreamId,
  /// Consuming vertex.
  pub target: VertexId,
  /// Input port on the consuming vertex.
  pub port: usize,
}

/// A runnable stage produced when the graph is finalized.
pub(crate) struct Stage {
  pub(crate) id: VertexId,
  pub(crate) name: String,
  pub(crate) oplet: Box<dyn Oplet>,
  /// For each output port, the `(target, input port)` pairs it feeds, in the
  /// order the edges were added.
  pub(crate) outputs: Vec<Vec<(VertexId, usize)>>,
}

/// The directed acyclic graph behind a topology.
#[derive(Debug)]
pub struct Graph {
  name: String,
  vertices: Vec<Vertex>,
  streams: Vec<StreamSlot>,
  edges: Vec<Edge>,
  finalized: bool,
}

impl Graph {
  /// Creates an empty graph.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      vertices: Vec::new(),
      streams: Vec::new(),
      edges: Vec::new(),
      finalized: false,
    }
  }

  /// Name of the graph.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether the graph has been submitted.
  pub fn is_finalized(&self) -> bool {
    self.finalized
  }

  /// Number of vertices.
  pub fn vertex_count(&self) -> usize {
    self.vertices.len()
  }

  /// Number of streams.
  pub fn stream_count(&self) -> usize {
    self.streams.len()
  }

  /// All edges in the order they were added.
  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  /// Looks up a vertex.
  pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
    self.vertices.get(id.0)
  }

  /// The vertex and output port producing `stream`.
  pub fn producer(&self, stream: StreamId) -> Option<(VertexId, usize)> {
    self
      .streams
      .get(stream.0)
      .map(|slot| (slot.producer, slot.port))
  }

  /// The `(vertex, port)` pairs consuming `stream`.
  pub fn consumers(&self, stream: StreamId) -> Vec<(VertexId, usize)> {
    self
      .edges
      .iter()
      .filter(|edge| edge.stream == stream)
      .map(|edge| (edge.target, edge.port))
      .collect()
  }

  /// Adds a vertex with the given arity and returns its id.
  ///
  /// One stream is created for every output port; see [`Graph::output`].
  pub fn add_vertex(
    &mut self,
    name: impl Into<String>,
    kind: VertexKind,
    oplet: Box<dyn Oplet>,
    inputs: usize,
    outputs: usize,
  ) -> Result<VertexId, GraphError> {
    self.check_mutable()?;
    let id = VertexId(self.vertices.len());
    let output_streams = (0..outputs)
      .map(|port| {
        self.streams.push(StreamSlot { producer: id, port });
        StreamId(self.streams.len() - 1)
      })
      .collect();
    self.vertices.push(Vertex {
      name: name.into(),
      kind,
      inputs: vec![None; inputs],
      outputs: output_streams,
      oplet: Some(oplet),
    });
    Ok(id)
  }

  /// Adds a stage with no inputs and returns its output stream.
  pub fn add_source(
    &mut self,
    name: impl Into<String>,
    oplet: Box<dyn Oplet>,
  ) -> Result<StreamId, GraphError> {
    let id = self.add_vertex(name, VertexKind::Source, oplet, 0, 1)?;
    self.output(id, 0)
  }

  /// Adds a one-in, one-out stage fed by `input` and returns its output stream.
  pub fn add_transform(
    &mut self,
    name: impl Into<String>,
    oplet: Box<dyn Oplet>,
    input: StreamId,
  ) -> Result<StreamId, GraphError> {
    self.check_stream(input)?;
    let id = self.add_vertex(name, VertexKind::Transform, oplet, 1, 1)?;
    self.connect(input, id, 0)?;
    self.output(id, 0)
  }

  /// Adds a terminal stage fed by `input`.
  pub fn add_sink(
    &mut self,
    name: impl Into<String>,
    oplet: Box<dyn Oplet>,
    input: StreamId,
  ) -> Result<VertexId, GraphError> {
    self.check_stream(input)?;
    let id = self.add_vertex(name, VertexKind::Sink, oplet, 1, 0)?;
    self.connect(input, id, 0)?;
    Ok(id)
  }

  /// Stream produced by output `port` of `vertex`.
  pub fn output(&self, vertex: VertexId, port: usize) -> Result<StreamId, GraphError> {
    let v = self
      .vertices
      .get(vertex.0)
      .ok_or(GraphError::UnknownVertex(vertex))?;
    v.outputs
      .get(port)
      .copied()
      .ok_or(GraphError::PortOutOfRange {
        vertex,
        port,
        arity: v.outputs.len(),
      })
  }

  /// Connects `stream` to input `port` of `target`.
  ///
  /// # Errors
  ///
  /// Fails if either id is unknown, the port is out of range or already
  /// connected, the edge would close a cycle, or the graph is finalized.
  pub fn connect(
    &mut self,
    stream: StreamId,
    target: VertexId,
    port: usize,
  ) -> Result<(), GraphError> {
    self.check_mutable()?;
    let producer = self.check_stream(stream)?;
    let vertex = self
      .vertices
      .get(target.0)
      .ok_or(GraphError::UnknownVertex(target))?;
    match vertex.inputs.get(port) {
      None => {
        return Err(GraphError::PortOutOfRange {
          vertex: target,
          port,
          arity: vertex.inputs.len(),
        });
      }
      Some(Some(_)) => {
        return Err(GraphError::InputAlreadyConnected {
          vertex: target,
          port,
        });
      }
      Some(None) => {}
    }

    if self.reaches(target, producer) {
      return Err(GraphError::Cycle { stream, target });
    }

    self.vertices[target.0].inputs[port] = Some(stream);
    self.edges.push(Edge {
      stream,
      target,
      port,
    });
    Ok(())
  }

  /// Moves the oplets out into runnable stages and freezes the graph.
  pub(crate) fn finalize(&mut self) -> Result<Vec<Stage>, GraphError> {
    self.check_mutable()?;
    for (index, vertex) in self.vertices.iter().enumerate() {
      if let Some(port) = vertex.inputs.iter().position(Option::is_none) {
        return Err(GraphError::UnconnectedInput {
          vertex: VertexId(index),
          name: vertex.name.clone(),
          port,
        });
      }
    }

    let mut routes: Vec<Vec<Vec<(VertexId, usize)>>> = self
      .vertices
      .iter()
      .map(|vertex| vec![Vec::new(); vertex.outputs.len()])
      .collect();
    for edge in &self.edges {
      let slot = self.streams[edge.stream.0];
      routes[slot.producer.0][slot.port].push((edge.target, edge.port));
    }

    let mut stages = Vec::with_capacity(self.vertices.len());
    for ((index, vertex), outputs) in self.vertices.iter_mut().enumerate().zip(routes) {
      let oplet = vertex
        .oplet
        .take()
        .ok_or_else(|| GraphError::Finalized(self.name.clone()))?;
      stages.push(Stage {
        id: VertexId(index),
        name: vertex.name.clone(),
        oplet,
        outputs,
      });
    }
    self.finalized = true;
    Ok(stages)
  }

  fn check_mutable(&self) -> Result<(), GraphError> {
    if self.finalized {
      return Err(GraphError::Finalized(self.name.clone()));
    }
    Ok(())
  }

  fn check_stream(&self, stream: StreamId) -> Result<VertexId, GraphError> {
    self
      .streams
      .get(stream.0)
      .map(|slot| slot.producer)
      .ok_or(GraphError::UnknownStream(stream))
  }

  fn successors(&self, vertex: VertexId) -> impl Iterator<Item = VertexId> + '_ {
    self
      .edges
      .iter()
      .filter(move |edge| self.streams[edge.stream.0].producer == vertex)
      .map(|edge| edge.target)
  }

  /// Whether `to` is reachable from `from` (a vertex reaches itself).
  fn reaches(&self, from: VertexId, to: VertexId) -> bool {
    let mut visited = vec![false; self.vertices.len()];
    let mut stack = vec![from];
    while let Some(vertex) = stack.pop() {
      if vertex == to {
        return true;
      }
      if std::mem::replace(&mut visited[vertex.0], true) {
        continue;
      }
      stack.extend(self.successors(vertex));
    }
    false
  }
}

/// Orders the vertices so that every producer precedes its consumers.
///
/// Uses Kahn's algorithm, seeding the queue in id order so the result is
/// deterministic. The graph is acyclic by construction, so every vertex is
/// always returned.
pub fn topological_sort(graph: &Graph) -> Vec<VertexId> {
  let count = graph.vertices.len();
  let mut in_degree = vec![0usize; count];
  let mut adjacency: Vec<Vec<VertexId>> = vec![Vec::new(); count];

  for edge in &graph.edges {
    let source = graph.streams[edge.stream.0].producer;
    adjacency[source.0].push(edge.target);
    in_degree[edge.target.0] += 1;
  }

  let mut queue: VecDeque<VertexId> = (0..count)
    .filter(|&index| in_degree[index] == 0)
    .map(VertexId)
    .collect();

  let mut result = Vec::with_capacity(count);
  while let Some(vertex) = queue.pop_front() {
    result.push(vertex);
    for neighbor in &adjacency[vertex.0] {
      let degree = &mut in_degree[neighbor.0];
      *degree -= 1;
      if *degree == 0 {
        queue.push_back(*neighbor);
      }
    }
  }
  result
}

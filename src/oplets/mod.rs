//! Built-in oplets.
//!
//! Most applications never construct these directly; the
//! [`Stream`](crate::topology::Stream) and [`Topology`](crate::topology::Topology)
//! builder methods and the [`plumbing`](crate::plumbing) functions add them to
//! the graph.

pub mod fan;
pub mod functional;
pub mod source;

pub use fan::{Barrier, ConsumedHook, Split, Union};
pub use functional::{FilterMap, Peek, Sink, TryMap};
pub use source::{EventSource, IterSource, PollSource, Submitter};

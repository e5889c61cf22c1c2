//! Shared State Table (SST) and predicate engine.
//!
//! The SST is a fixed-size table with one row per group member. A node may
//! only write its own row; peer rows are read-only mirrors that are refreshed
//! by one-sided row replication through a [`RowMesh`]. Protocol progress is
//! driven by a [`Predicates`] engine that repeatedly evaluates registered
//! `(predicate, trigger)` pairs against the table on a dedicated thread.
//!
//! These types are kept in a small, dependency-light crate because they are
//! shared by the multicast engine, the view manager, and the test harnesses.

mod mesh;
mod predicates;
mod sst;

pub use mesh::MemoryMesh;
pub use predicates::{PredicateHandle, PredicateMode, Predicates};
pub use sst::{RowMesh, RowSink, Sst};

/// Logical node identifier within a group.
pub type NodeId = u32;

//! Dependency Graph
//!
//! This module holds the graph-level machinery shared by every node variant:
//! node identity and bookkeeping, the connect/disconnect lifecycle, and the
//! scheduler that spreads staleness and runs reactors.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are atoms, constants, derivations, lenses, sources and reactors.
//! - An edge from A to B means B read A during its last evaluation.
//!
//! # Design Decisions
//!
//! 1. Ownership points upstream. An observer holds strong references to its
//!    dependencies; a dependency only knows the ids of its observers. Dropping
//!    the last handle to a downstream node therefore frees it without any
//!    bookkeeping on the upstream side.
//!
//! 2. Ids resolve through a per-graph registry of weak references, so walking
//!    downstream never keeps a node alive.
//!
//! 3. Shared behaviour lives in `NodeCore`; variants only implement what
//!    differs (how the value is produced and whether it can be set).

mod lifecycle;
mod node;
mod scheduler;

pub use node::{NodeId, NodeKind};

pub(crate) use lifecycle::Lifecycle;
pub(crate) use node::{AnyNode, Freshness, NodeCore};
pub(crate) use scheduler::Scheduler;

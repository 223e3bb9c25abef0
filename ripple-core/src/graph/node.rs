//! Graph Nodes
//!
//! This module defines the identity of a node and the bookkeeping layer every
//! node variant shares: version, connection flag, finality, autoCache mode,
//! freshness and the list of observers registered on it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::Result;
use crate::reactive::ledger::Dependencies;
use crate::reactive::runtime::Runtime;

/// Unique identifier for a node in the dependency graph.
///
/// Ids are handed out by the owning graph and never reused within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A mutable root.
    Atom,

    /// An immutable leaf. Always final.
    Constant,

    /// A value computed purely from other nodes.
    Derivation,

    /// A derivation with a custom write path.
    Lens,

    /// A value pulled from an external producer.
    Source,

    /// A subscription callback. Reactors observe but are never observed.
    Reactor,
}

impl NodeKind {
    /// Whether nodes of this kind record dependencies.
    pub fn is_observer(self) -> bool {
        matches!(self, Self::Derivation | Self::Lens | Self::Reactor)
    }
}

/// How much an observer trusts its cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Freshness {
    /// Nothing upstream changed since the last evaluation.
    Fresh,

    /// Something upstream changed. Dependency versions decide whether a
    /// recompute is needed.
    MaybeStale,

    /// The node must re-evaluate on next use.
    Dirty,
}

/// State shared by every node variant.
pub(crate) struct NodeCore {
    id: NodeId,
    kind: NodeKind,
    runtime: Rc<Runtime>,

    /// Bumped only when the node's state actually changes.
    version: Cell<u64>,
    connected: Cell<bool>,
    finalized: Cell<bool>,
    auto_cache: Cell<bool>,
    freshness: Cell<Freshness>,

    /// Ids of the observers currently registered on this node.
    observers: RefCell<SmallVec<[NodeId; 4]>>,
}

impl NodeCore {
    pub(crate) fn new(runtime: &Rc<Runtime>, kind: NodeKind) -> Self {
        Self {
            id: runtime.next_node_id(),
            kind,
            runtime: Rc::clone(runtime),
            version: Cell::new(0),
            connected: Cell::new(false),
            finalized: Cell::new(false),
            auto_cache: Cell::new(false),
            freshness: Cell::new(Freshness::Dirty),
            observers: RefCell::new(SmallVec::new()),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.get()
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.version.set(version);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    pub(crate) fn is_final(&self) -> bool {
        self.finalized.get()
    }

    pub(crate) fn set_final(&self, finalized: bool) {
        self.finalized.set(finalized);
    }

    pub(crate) fn is_auto_cached(&self) -> bool {
        self.auto_cache.get()
    }

    pub(crate) fn set_auto_cache(&self, enabled: bool) {
        self.auto_cache.set(enabled);
    }

    pub(crate) fn freshness(&self) -> Freshness {
        self.freshness.get()
    }

    pub(crate) fn set_freshness(&self, freshness: Freshness) {
        self.freshness.set(freshness);
    }

    /// Raise freshness to at least `level`. Never lowers it.
    pub(crate) fn mark(&self, level: Freshness) {
        if level > self.freshness.get() {
            self.freshness.set(level);
        }
    }

    /// Register an observer. Returns true on the 0 -> 1 transition.
    pub(crate) fn add_observer(&self, observer: NodeId) -> bool {
        let mut observers = self.observers.borrow_mut();
        if observers.contains(&observer) {
            return false;
        }
        observers.push(observer);
        observers.len() == 1
    }

    /// Unregister an observer. Returns true on the 1 -> 0 transition.
    pub(crate) fn remove_observer(&self, observer: NodeId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|id| *id != observer);
        before > 0 && observers.is_empty() && before != observers.len()
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    pub(crate) fn observer_ids(&self) -> SmallVec<[NodeId; 4]> {
        self.observers.borrow().clone()
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        self.runtime.unregister(self.id);
    }
}

/// Type-erased behaviour of a node, as seen by the ledger, the lifecycle
/// layer and the scheduler.
pub(crate) trait AnyNode {
    fn core(&self) -> &NodeCore;

    /// Called on the 0 -> 1 observer transition, or when an autoCache node is
    /// read while disconnected.
    fn connect(&self);

    /// Called when the node is orphaned (or found orphaned at flush time).
    fn disconnect(&self);

    /// Bring the cached state up to date. Only computed nodes do any work.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Make the node final. Returns false when the node does not qualify.
    fn finalize(&self) -> bool {
        self.core().is_final()
    }

    /// The dependency edge list, for nodes that observe.
    fn dependencies(&self) -> Option<&RefCell<Dependencies>> {
        None
    }

    /// Reactors re-run here when an upstream change reached them.
    fn react_if_needed(&self) {}

    /// Sources poll their producer here.
    fn check_for_changes(&self) {}
}

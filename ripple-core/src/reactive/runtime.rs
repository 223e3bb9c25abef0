//! Reactive Runtime
//!
//! The runtime is the central coordinator of one graph. It owns everything
//! nodes share: the id counter and version clock, the registry that resolves
//! ids to nodes, the recording ledger, the transaction stack, the deferred
//! disconnect batch, the reactor queue and the set of running reactors.
//!
//! # How It Works
//!
//! 1. When a node is created, it registers a weak reference here.
//!
//! 2. When a derivation or reactor reads a node, the ledger records the
//!    dependency and registers the reader as an observer.
//!
//! 3. When a root node changes, the runtime:
//!    a. Records the old state in the innermost transaction
//!    b. Marks downstream observers as stale
//!    c. On outermost commit, runs every reactor reached, once
//!    d. Derivations stay lazy and recompute on their next read
//!
//! # Threading
//!
//! A graph is single-threaded. [`Graph`] is `!Send`, and re-entrancy is
//! handled by the stacks it owns rather than by locks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::Result;
use crate::graph::{AnyNode, Lifecycle, NodeId, Scheduler};

use super::atom::Atom;
use super::constant::Constant;
use super::derivable::{DeriveArgs, Derivable};
use super::derivation::Derivation;
use super::ledger::Ledger;
use super::lens;
use super::source::{Source, SourceHooks};
use super::state::{default_equality, Equality, State};
use super::transaction::Transactions;

/// Shared state of one graph.
pub(crate) struct Runtime {
    config: GraphConfig,

    next_id: Cell<u64>,

    /// Graph-wide version clock. Versions are drawn from it so a restored
    /// version can never collide with a later one.
    clock: Cell<u64>,

    /// Maps node ids to weak references to avoid preventing cleanup.
    registry: RefCell<HashMap<NodeId, Weak<dyn AnyNode>>>,

    pub(crate) ledger: Ledger,
    pub(crate) transactions: Transactions,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) scheduler: Scheduler,

    /// Running reactors. Nothing observes a reactor, so this is what keeps a
    /// detached one alive. The reactor holds the runtime in turn; the cycle is
    /// broken when the reactor stops.
    reactors: RefCell<IndexMap<NodeId, Rc<dyn AnyNode>>>,
}

impl Runtime {
    pub(crate) fn new(config: GraphConfig) -> Self {
        Self {
            config,
            next_id: Cell::new(0),
            clock: Cell::new(0),
            registry: RefCell::new(HashMap::new()),
            ledger: Ledger::default(),
            transactions: Transactions::default(),
            lifecycle: Lifecycle::default(),
            scheduler: Scheduler::default(),
            reactors: RefCell::new(IndexMap::new()),
        }
    }

    pub(crate) fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        NodeId::from_raw(id)
    }

    /// Draw the next version number.
    pub(crate) fn tick(&self) -> u64 {
        let version = self.clock.get() + 1;
        self.clock.set(version);
        version
    }

    pub(crate) fn register<N: AnyNode + 'static>(&self, node: &Rc<N>) {
        let erased: Rc<dyn AnyNode> = Rc::clone(node) as Rc<dyn AnyNode>;
        self.registry
            .borrow_mut()
            .insert(erased.core().id(), Rc::downgrade(&erased));
    }

    pub(crate) fn unregister(&self, id: NodeId) {
        self.registry.borrow_mut().remove(&id);
    }

    pub(crate) fn lookup(&self, id: NodeId) -> Option<Rc<dyn AnyNode>> {
        self.registry.borrow().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn node_count(&self) -> usize {
        self.registry
            .borrow()
            .values()
            .filter(|node| node.strong_count() > 0)
            .count()
    }

    pub(crate) fn retain_reactor(&self, reactor: Rc<dyn AnyNode>) {
        let id = reactor.core().id();
        self.reactors.borrow_mut().insert(id, reactor);
    }

    /// Drop the runtime's hold on a reactor. The caller decides when the
    /// returned handle goes away.
    pub(crate) fn release_reactor(&self, id: NodeId) -> Option<Rc<dyn AnyNode>> {
        self.reactors.borrow_mut().shift_remove(&id)
    }

    pub(crate) fn active_reactors(&self) -> usize {
        self.reactors.borrow().len()
    }
}

/// Handle to an incremental-computation graph.
///
/// A graph owns the recording stack, the transaction stack, the node registry
/// and the reactor scheduler. Nodes created from different graphs must not be
/// mixed. Cloning the handle is cheap and shares the graph.
///
/// # Example
///
/// ```
/// use ripple_core::Graph;
///
/// let graph = Graph::new();
/// let count = graph.atom(1);
/// let doubled = count.map(|n| n * 2);
///
/// count.set(21).unwrap();
/// assert_eq!(doubled.get().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct Graph {
    runtime: Rc<Runtime>,
}

impl Graph {
    /// Create a graph with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        debug!(graph = %config.label, "graph created");
        Self {
            runtime: Rc::new(Runtime::new(config)),
        }
    }

    pub(crate) fn from_runtime(runtime: Rc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn config(&self) -> &GraphConfig {
        self.runtime.config()
    }

    /// Create a mutable root holding `value`.
    pub fn atom<T: Clone + PartialEq + 'static>(&self, value: T) -> Derivable<T> {
        self.atom_with_equals(value, |a: &T, b: &T| a == b)
    }

    /// Create a mutable root with a custom equality.
    ///
    /// Writes of a value equal to the current one are ignored.
    pub fn atom_with_equals<T: Clone + 'static>(
        &self,
        value: T,
        equals: impl Fn(&T, &T) -> bool + 'static,
    ) -> Derivable<T> {
        let equality: Equality<T> = Rc::new(equals);
        Derivable::from_node(Atom::new(&self.runtime, State::Value(value), equality))
    }

    /// Create a mutable root with no value yet.
    pub fn unresolved_atom<T: Clone + PartialEq + 'static>(&self) -> Derivable<T> {
        Derivable::from_node(Atom::new(&self.runtime, State::Unresolved, default_equality()))
    }

    /// Create an immutable, final leaf.
    pub fn constant<T: Clone + 'static>(&self, value: T) -> Derivable<T> {
        Derivable::from_node(Constant::new(&self.runtime, value))
    }

    /// Create a derivation from a deriver closure.
    ///
    /// Every node the closure reads becomes a dependency. Use `?` on reads to
    /// propagate unresolved and errored inputs.
    pub fn derive<T: Clone + PartialEq + 'static>(
        &self,
        deriver: impl Fn() -> Result<T> + 'static,
    ) -> Derivable<T> {
        self.derive_with_equals(deriver, |a: &T, b: &T| a == b)
    }

    pub fn derive_with_equals<T: Clone + 'static>(
        &self,
        deriver: impl Fn() -> Result<T> + 'static,
        equals: impl Fn(&T, &T) -> bool + 'static,
    ) -> Derivable<T> {
        let equality: Equality<T> = Rc::new(equals);
        Derivable::from_node(Derivation::new(&self.runtime, Box::new(deriver), equality))
    }

    /// Create a derivation over node arguments.
    ///
    /// The arguments are unwrapped before `deriver` runs; if any of them is
    /// unresolved or errored, so is the result.
    ///
    /// ```
    /// use ripple_core::Graph;
    ///
    /// let graph = Graph::new();
    /// let width = graph.atom(3);
    /// let height = graph.atom(4);
    /// let area = graph.derive_with((width, height), |(w, h)| Ok(w * h));
    ///
    /// assert_eq!(area.get().unwrap(), 12);
    /// ```
    pub fn derive_with<A, T>(
        &self,
        args: A,
        deriver: impl Fn(A::Values) -> Result<T> + 'static,
    ) -> Derivable<T>
    where
        A: DeriveArgs,
        T: Clone + PartialEq + 'static,
    {
        self.derive(move || deriver(args.values()?))
    }

    /// Create a lens: a derivation with a custom write path.
    ///
    /// `setter` runs in its own transaction and outside any recording.
    pub fn lens<T: Clone + PartialEq + 'static>(
        &self,
        getter: impl Fn() -> Result<T> + 'static,
        setter: impl Fn(T) -> Result<()> + 'static,
    ) -> Derivable<T> {
        Derivable::from_node(lens::new(
            &self.runtime,
            Box::new(getter),
            Box::new(setter),
            default_equality(),
        ))
    }

    /// Create a node driven by an external producer.
    pub fn source<T: Clone + PartialEq + 'static>(
        &self,
        hooks: impl SourceHooks<T>,
    ) -> Derivable<T> {
        Derivable::from_node(Source::new(&self.runtime, Box::new(hooks), default_equality()))
    }

    pub fn source_with_equals<T: Clone + 'static>(
        &self,
        hooks: impl SourceHooks<T>,
        equals: impl Fn(&T, &T) -> bool + 'static,
    ) -> Derivable<T> {
        let equality: Equality<T> = Rc::new(equals);
        Derivable::from_node(Source::new(&self.runtime, Box::new(hooks), equality))
    }

    /// Run `f` in a new, possibly nested, transaction.
    ///
    /// `Ok` commits. `Err`, or a panic unwinding out of `f`, restores every
    /// node the transaction touched. Reactors run once, after the outermost
    /// transaction commits.
    pub fn transact<R, E>(
        &self,
        f: impl FnOnce() -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E> {
        self.runtime.transact(f)
    }

    /// Like [`Graph::transact`], but joins the active transaction if there is
    /// one.
    pub fn atomically<R, E>(
        &self,
        f: impl FnOnce() -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E> {
        self.runtime.atomically(f)
    }

    /// Run `f` without recording its reads as dependencies.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.runtime.run_independently(f)
    }

    pub fn in_transaction(&self) -> bool {
        self.runtime.in_transaction()
    }

    /// Disconnect autoCache nodes that stayed orphaned since they were
    /// deferred. Hosts call this at their tick boundary.
    pub fn flush_pending_disconnects(&self) -> usize {
        self.runtime.flush_pending_disconnects()
    }

    pub fn pending_disconnects(&self) -> usize {
        self.runtime.pending_disconnects()
    }

    pub fn active_reactors(&self) -> usize {
        self.runtime.active_reactors()
    }

    /// Number of live nodes created from this graph.
    pub fn node_count(&self) -> usize {
        self.runtime.node_count()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("label", &self.runtime.config().label)
            .field("nodes", &self.runtime.node_count())
            .field("active_reactors", &self.runtime.active_reactors())
            .field("transaction_depth", &self.runtime.transaction_depth())
            .field("queued_reactions", &self.runtime.queued_reactions())
            .finish()
    }
}

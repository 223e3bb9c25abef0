//! Observation Ledger
//!
//! The ledger tracks which computation is currently running and which nodes it
//! reads. This is what makes dependency tracking automatic: a node's read path
//! reports itself here, and the innermost recording session adds it to the
//! running observer's dependency list.
//!
//! # Reconciliation
//!
//! An observer keeps its dependencies from the previous evaluation. A session
//! walks a `confirmed` cursor through that list as reads arrive:
//!
//! - a read of the dependency at the cursor just advances it;
//! - a read of a dependency further down swaps it to the cursor;
//! - a read of an unknown node inserts it at the cursor and, when the observer
//!   is connected, registers the observer on it.
//!
//! When the session closes, everything past the cursor was not read this round
//! and is dropped. The list therefore always equals the exact set of nodes the
//! last evaluation touched, in first-touch order.
//!
//! Sessions nest. A `None` entry on the stack shields reads from the
//! enclosing session (see [`Runtime::run_independently`]).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::graph::{AnyNode, NodeId};

use super::runtime::Runtime;

/// The dependency list of one observer.
#[derive(Default)]
pub(crate) struct Dependencies {
    /// Dependencies in first-touch order.
    nodes: Vec<Rc<dyn AnyNode>>,

    /// Version of each dependency when it was last confirmed.
    versions: HashMap<NodeId, u64>,
}

/// Outcome of matching one read against the previous dependency list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    AlreadyConfirmed,
    Confirmed,
    Inserted,
}

impl Dependencies {
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.core().id()).collect()
    }

    /// Clone the list so callers can walk it without holding the borrow.
    pub(crate) fn snapshot(&self) -> Vec<Rc<dyn AnyNode>> {
        self.nodes.clone()
    }

    /// Each dependency paired with the version seen at last confirmation.
    pub(crate) fn versioned(&self) -> Vec<(Rc<dyn AnyNode>, u64)> {
        self.nodes
            .iter()
            .map(|node| {
                let seen = self.versions.get(&node.core().id()).copied().unwrap_or(0);
                (Rc::clone(node), seen)
            })
            .collect()
    }

    pub(crate) fn take(&mut self) -> Vec<Rc<dyn AnyNode>> {
        self.versions.clear();
        std::mem::take(&mut self.nodes)
    }

    pub(crate) fn all_final(&self) -> bool {
        self.nodes.iter().all(|node| node.core().is_final())
    }

    fn confirm(&mut self, dependency: &Rc<dyn AnyNode>, confirmed: usize) -> Confirmation {
        let id = dependency.core().id();
        match self.nodes.iter().position(|node| node.core().id() == id) {
            Some(index) if index < confirmed => Confirmation::AlreadyConfirmed,
            Some(index) => {
                self.nodes.swap(index, confirmed);
                Confirmation::Confirmed
            }
            None => {
                self.nodes.insert(confirmed, Rc::clone(dependency));
                Confirmation::Inserted
            }
        }
    }

    /// Drop everything past `confirmed` and snapshot the survivors' versions.
    fn settle(&mut self, confirmed: usize) -> Vec<Rc<dyn AnyNode>> {
        let dropped = if confirmed < self.nodes.len() {
            self.nodes.split_off(confirmed)
        } else {
            Vec::new()
        };

        self.versions.clear();
        for node in &self.nodes {
            self.versions.insert(node.core().id(), node.core().version());
        }
        dropped
    }
}

/// One active recording.
struct Session {
    observer: Rc<dyn AnyNode>,

    /// Number of dependencies confirmed so far this round.
    confirmed: usize,

    /// Total reads this round, repeats included.
    reads: usize,

    /// Whether every read so far was of a final node.
    all_final: bool,
}

/// The recording-session stack of one graph.
#[derive(Default)]
pub(crate) struct Ledger {
    /// `None` marks an independent section.
    sessions: RefCell<Vec<Option<Session>>>,

    /// Finalizations requested while a session was open.
    deferred_finals: RefCell<Vec<Rc<dyn AnyNode>>>,
}

/// Guard for an open recording session.
///
/// Call [`Recording::finish`] to reconcile. If the guard is dropped instead
/// (the evaluation panicked), the session is still closed so the stack stays
/// balanced.
pub(crate) struct Recording<'a> {
    runtime: &'a Runtime,
    finished: bool,
}

impl Recording<'_> {
    /// Close the session. Returns true when every dependency read this round
    /// was final.
    pub(crate) fn finish(mut self) -> bool {
        self.finished = true;
        self.runtime.stop_recording()
    }
}

impl Drop for Recording<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.runtime.stop_recording();
        }
    }
}

/// Guard for an independent section.
struct Independent<'a> {
    runtime: &'a Runtime,
}

impl Drop for Independent<'_> {
    fn drop(&mut self) {
        let now_empty = {
            let mut sessions = self.runtime.ledger.sessions.borrow_mut();
            sessions.pop();
            sessions.is_empty()
        };
        if now_empty {
            self.runtime.flush_deferred_finals();
        }
    }
}

impl Runtime {
    /// Open a recording session for `observer`.
    ///
    /// Fails with [`Error::Cycle`] when the observer is already being
    /// recorded further up the stack.
    pub(crate) fn start_recording(&self, observer: Rc<dyn AnyNode>) -> Result<Recording<'_>> {
        let id = observer.core().id();
        if self.is_recording(id) {
            warn!(node = %id, graph = %self.config().label, "cyclic dependency detected");
            return Err(Error::Cycle(id));
        }

        self.ledger.sessions.borrow_mut().push(Some(Session {
            observer,
            confirmed: 0,
            reads: 0,
            all_final: true,
        }));

        Ok(Recording {
            runtime: self,
            finished: false,
        })
    }

    /// Whether `id` has an open session anywhere on the stack.
    pub(crate) fn is_recording(&self, id: NodeId) -> bool {
        self.ledger
            .sessions
            .borrow()
            .iter()
            .flatten()
            .any(|session| session.observer.core().id() == id)
    }

    /// Whether any session (recording or independent) is open.
    pub(crate) fn is_evaluating(&self) -> bool {
        !self.ledger.sessions.borrow().is_empty()
    }

    /// Report a read of `dependency` to the innermost session.
    pub(crate) fn record_observation(&self, dependency: &Rc<dyn AnyNode>) {
        let is_final = dependency.core().is_final();
        let (observer, confirmed) = {
            let mut sessions = self.ledger.sessions.borrow_mut();
            let Some(Some(session)) = sessions.last_mut() else {
                return;
            };
            session.reads += 1;
            session.all_final &= is_final;
            (Rc::clone(&session.observer), session.confirmed)
        };

        let Some(dependencies) = observer.dependencies() else {
            return;
        };
        let outcome = dependencies.borrow_mut().confirm(dependency, confirmed);
        if outcome == Confirmation::AlreadyConfirmed {
            return;
        }

        if let Some(Some(session)) = self.ledger.sessions.borrow_mut().last_mut() {
            session.confirmed += 1;
        }

        if outcome == Confirmation::Inserted && observer.core().is_connected() {
            self.add_observer(dependency, observer.core().id());
        }
    }

    /// Close the innermost session and reconcile its observer.
    ///
    /// Returns true when the round read at least one node and every node it
    /// read was final.
    fn stop_recording(&self) -> bool {
        let popped = self.ledger.sessions.borrow_mut().pop();
        let Some(Some(session)) = popped else {
            return false;
        };

        let observer = &session.observer;
        let id = observer.core().id();
        if let Some(dependencies) = observer.dependencies() {
            let dropped = dependencies.borrow_mut().settle(session.confirmed);
            if !dropped.is_empty() {
                trace!(node = %id, dropped = dropped.len(), "dependencies dropped");
                if observer.core().is_connected() {
                    for dependency in &dropped {
                        self.remove_observer(dependency, id);
                    }
                }
            }
        }

        if !self.is_evaluating() {
            self.flush_deferred_finals();
        }

        session.reads > 0 && session.all_final
    }

    /// Run `f` with no active recording.
    ///
    /// Reads inside `f` are not attributed to the enclosing observer.
    pub(crate) fn run_independently<R>(&self, f: impl FnOnce() -> R) -> R {
        self.ledger.sessions.borrow_mut().push(None);
        let _guard = Independent { runtime: self };
        f()
    }

    /// Whether any dependency moved past the version recorded for it.
    ///
    /// Each dependency is refreshed first, in order, and the walk stops at the
    /// first change.
    pub(crate) fn dependencies_changed(&self, dependencies: &RefCell<Dependencies>) -> bool {
        let versioned = dependencies.borrow().versioned();
        for (dependency, seen) in &versioned {
            if dependency.refresh().is_err() || dependency.core().version() != *seen {
                return true;
            }
        }
        false
    }

    pub(crate) fn defer_final(&self, node: Rc<dyn AnyNode>) {
        self.ledger.deferred_finals.borrow_mut().push(node);
    }

    fn flush_deferred_finals(&self) {
        let deferred = std::mem::take(&mut *self.ledger.deferred_finals.borrow_mut());
        if !deferred.is_empty() {
            self.apply_finals(deferred);
        }
    }
}

/// Report a read of the node behind `weak` to the innermost session.
pub(crate) fn record<N: AnyNode + 'static>(weak: &Weak<N>) {
    if let Some(node) = weak.upgrade() {
        let runtime = Rc::clone(node.core().runtime());
        let node: Rc<dyn AnyNode> = node;
        runtime.record_observation(&node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeCore, NodeKind};
    use crate::GraphConfig;

    struct Probe {
        core: NodeCore,
        dependencies: RefCell<Dependencies>,
    }

    impl AnyNode for Probe {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn connect(&self) {
            self.core.set_connected(true);
        }

        fn disconnect(&self) {
            self.core.set_connected(false);
        }

        fn dependencies(&self) -> Option<&RefCell<Dependencies>> {
            Some(&self.dependencies)
        }
    }

    fn stub_node(runtime: &Rc<Runtime>, kind: NodeKind) -> Rc<dyn AnyNode> {
        Rc::new(Probe {
            core: NodeCore::new(runtime, kind),
            dependencies: RefCell::new(Dependencies::default()),
        })
    }

    fn deps_of(node: &Rc<dyn AnyNode>) -> Vec<NodeId> {
        node.dependencies().map(|d| d.borrow().ids()).unwrap_or_default()
    }

    fn evaluate(runtime: &Runtime, observer: &Rc<dyn AnyNode>, reads: &[&Rc<dyn AnyNode>]) -> bool {
        let recording = runtime
            .start_recording(Rc::clone(observer))
            .expect("no cycle");
        for node in reads {
            runtime.record_observation(node);
        }
        recording.finish()
    }

    #[test]
    fn records_in_first_touch_order() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        let a = stub_node(&runtime, NodeKind::Atom);
        let b = stub_node(&runtime, NodeKind::Atom);

        evaluate(&runtime, &observer, &[&b, &a, &b]);
        assert_eq!(deps_of(&observer), vec![b.core().id(), a.core().id()]);

        evaluate(&runtime, &observer, &[&a, &b]);
        assert_eq!(deps_of(&observer), vec![a.core().id(), b.core().id()]);
    }

    #[test]
    fn drops_dependencies_not_read_again() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        observer.connect();
        let a = stub_node(&runtime, NodeKind::Atom);
        let b = stub_node(&runtime, NodeKind::Atom);

        evaluate(&runtime, &observer, &[&a, &b]);
        assert_eq!(a.core().observer_count(), 1);
        assert_eq!(b.core().observer_count(), 1);

        evaluate(&runtime, &observer, &[&b]);
        assert_eq!(deps_of(&observer), vec![b.core().id()]);
        assert_eq!(a.core().observer_count(), 0);
        assert!(!a.core().is_connected());
        assert_eq!(b.core().observer_count(), 1);
    }

    #[test]
    fn disconnected_observers_do_not_register() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        let a = stub_node(&runtime, NodeKind::Atom);

        evaluate(&runtime, &observer, &[&a]);
        assert_eq!(deps_of(&observer), vec![a.core().id()]);
        assert_eq!(a.core().observer_count(), 0);
    }

    #[test]
    fn detects_cycles() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        let id = observer.core().id();

        let outer = runtime.start_recording(Rc::clone(&observer)).expect("first");
        assert!(runtime.is_recording(id));
        match runtime.start_recording(Rc::clone(&observer)) {
            Err(Error::Cycle(node)) => assert_eq!(node, id),
            _ => panic!("expected a cycle error"),
        }
        outer.finish();
        assert!(!runtime.is_recording(id));
    }

    #[test]
    fn independent_sections_are_not_recorded() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        let a = stub_node(&runtime, NodeKind::Atom);
        let b = stub_node(&runtime, NodeKind::Atom);

        let recording = runtime.start_recording(Rc::clone(&observer)).expect("no cycle");
        runtime.record_observation(&a);
        runtime.run_independently(|| runtime.record_observation(&b));
        recording.finish();

        assert_eq!(deps_of(&observer), vec![a.core().id()]);
    }

    #[test]
    fn all_final_requires_reads() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        let leaf = stub_node(&runtime, NodeKind::Constant);
        leaf.core().set_final(true);

        assert!(!evaluate(&runtime, &observer, &[]));
        assert!(evaluate(&runtime, &observer, &[&leaf]));
    }

    #[test]
    fn dropped_guard_still_pops() {
        let runtime = Rc::new(Runtime::new(GraphConfig::default()));
        let observer = stub_node(&runtime, NodeKind::Derivation);
        {
            let _recording = runtime.start_recording(Rc::clone(&observer)).expect("no cycle");
            assert!(runtime.is_evaluating());
        }
        assert!(!runtime.is_evaluating());
    }
}

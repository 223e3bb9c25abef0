//! Atom Implementation
//!
//! An atom is a mutable root: the only kind of node whose state is written
//! directly. Every accepted write runs inside a transaction, which snapshots
//! the old state on first touch so an abort can put it back.
//!
//! # Writes
//!
//! 1. A final atom refuses every write.
//! 2. A write equal to the current state is a no-op: the version stays and no
//!    reactor runs.
//! 3. Otherwise the state is replaced, the version moves forward and observers
//!    are marked stale. Reactors run when the outermost transaction commits.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::error::{Error, Result};
use crate::graph::{AnyNode, Freshness, NodeCore, NodeKind};

use super::derivable::Node;
use super::ledger;
use super::runtime::Runtime;
use super::state::{Equality, State};

/// A mutable root node.
pub(crate) struct Atom<T> {
    core: NodeCore,
    self_ref: Weak<Self>,
    state: RefCell<State<T>>,
    equality: Equality<T>,
}

impl<T: Clone + 'static> Atom<T> {
    pub(crate) fn new(runtime: &Rc<Runtime>, state: State<T>, equality: Equality<T>) -> Rc<Self> {
        let atom = Rc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(runtime, NodeKind::Atom),
            self_ref: self_ref.clone(),
            state: RefCell::new(state),
            equality,
        });
        runtime.register(&atom);
        atom
    }

    /// Build the closure that puts this atom back the way it is now.
    fn snapshot(&self) -> Box<dyn FnOnce()> {
        let state = self.state.borrow().clone();
        let version = self.core.version();
        let finalized = self.core.is_final();
        let atom = self.self_ref.clone();

        Box::new(move || {
            if let Some(atom) = atom.upgrade() {
                atom.restore(state, version, finalized);
            }
        })
    }

    fn restore(&self, state: State<T>, version: u64, finalized: bool) {
        trace!(node = %self.core.id(), version, "atom restored");
        *self.state.borrow_mut() = state;
        self.core.set_version(version);
        self.core.set_final(finalized);
        self.core.runtime().invalidate(self.core.id(), Freshness::MaybeStale);
    }
}

impl<T: Clone + 'static> AnyNode for Atom<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn connect(&self) {
        self.core.set_connected(true);
    }

    fn disconnect(&self) {
        self.core.set_connected(false);
    }
}

impl<T: Clone + 'static> Node<T> for Atom<T> {
    fn state(&self) -> State<T> {
        let state = self.state.borrow().clone();
        ledger::record(&self.self_ref);
        state
    }

    fn equality(&self) -> Equality<T> {
        Rc::clone(&self.equality)
    }

    fn settable(&self) -> bool {
        !self.core.is_final()
    }

    fn set(&self, value: T) -> Result<()> {
        self.write(State::Value(value), false)
    }

    fn write(&self, state: State<T>, make_final: bool) -> Result<()> {
        let id = self.core.id();
        if self.core.is_final() {
            return Err(Error::Finalized(id));
        }

        let unchanged = self.state.borrow().same(&state, &self.equality);
        if unchanged && !make_final {
            trace!(node = %id, "write ignored, value unchanged");
            return Ok(());
        }

        let runtime = Rc::clone(self.core.runtime());
        runtime.atomically(|| {
            runtime.apply_change(id, || self.snapshot());

            if !unchanged {
                *self.state.borrow_mut() = state;
                self.core.set_version(runtime.tick());
                trace!(node = %id, version = self.core.version(), "atom written");
                runtime.invalidate(id, Freshness::MaybeStale);
                runtime.mark_changed(id);
            }

            if make_final {
                self.core.set_final(true);
                if let Some(atom) = self.self_ref.upgrade() {
                    runtime.mark_final(atom);
                }
            }
            Ok(())
        })
    }
}

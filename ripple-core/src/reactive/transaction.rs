//! Transactions
//!
//! Every mutation of a root node runs inside a transaction scope. The first
//! time a scope touches a node it stores a closure that puts the node back the
//! way it was, so an abort can undo the whole scope exactly.
//!
//! # Nesting
//!
//! - Abort restores the aborting scope's records in reverse touch order.
//!   Records merged up from children that already committed are part of that
//!   scope and get restored too.
//! - A nested commit hands its records to the parent. When both scopes touched
//!   a node, the parent's older snapshot wins.
//! - Only the outermost commit notifies reactors, once, with final state.
//!
//! Finalizations requested inside a scope are parked on it and applied right
//! before the outermost commit notifies. An abort hands them to the parent
//! scope, or applies them once the stack is empty. Each node re-checks that it
//! still qualifies, so an atom whose `set_final` was rolled back stays open.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::graph::{AnyNode, Freshness, NodeId};

use super::runtime::Runtime;

type Restore = Box<dyn FnOnce()>;

/// One open transaction.
#[derive(Default)]
struct Scope {
    /// Restore closure per touched node, in first-touch order.
    touched: IndexMap<NodeId, Restore>,

    /// Nodes whose state changed in this scope.
    changed: IndexSet<NodeId>,

    /// Nodes to finalize on outermost commit.
    finals: Vec<Rc<dyn AnyNode>>,
}

/// The transaction stack of one graph.
#[derive(Default)]
pub(crate) struct Transactions {
    scopes: RefCell<Vec<Scope>>,
}

/// Aborts the innermost scope unless disarmed.
///
/// The guard exists so a panic unwinding out of a transaction body still
/// rolls the scope back.
struct ScopeGuard<'a> {
    runtime: &'a Runtime,
    armed: bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.runtime.abort();
        }
    }
}

impl Runtime {
    /// Run `f` in a new (possibly nested) transaction scope.
    ///
    /// `Ok` commits, `Err` aborts and hands the error back.
    pub(crate) fn transact<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        self.transactions.scopes.borrow_mut().push(Scope::default());
        let mut guard = ScopeGuard {
            runtime: self,
            armed: true,
        };

        let result = f();
        guard.armed = false;

        match result {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(error) => {
                self.abort();
                Err(error)
            }
        }
    }

    /// Join the active transaction, or open one if there is none.
    pub(crate) fn atomically<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        if self.in_transaction() {
            f()
        } else {
            self.transact(f)
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        !self.transactions.scopes.borrow().is_empty()
    }

    pub(crate) fn transaction_depth(&self) -> usize {
        self.transactions.scopes.borrow().len()
    }

    /// Record the pre-change state of `id` in the innermost scope.
    ///
    /// `snapshot` only runs the first time the scope touches the node.
    pub(crate) fn apply_change(&self, id: NodeId, snapshot: impl FnOnce() -> Restore) {
        let first_touch = match self.transactions.scopes.borrow().last() {
            Some(scope) => !scope.touched.contains_key(&id),
            None => false,
        };
        if !first_touch {
            return;
        }

        let restore = snapshot();
        if let Some(scope) = self.transactions.scopes.borrow_mut().last_mut() {
            scope.touched.insert(id, restore);
        }
    }

    /// Note that `id` changed in the innermost scope.
    pub(crate) fn mark_changed(&self, id: NodeId) {
        if let Some(scope) = self.transactions.scopes.borrow_mut().last_mut() {
            scope.changed.insert(id);
        }
    }

    /// Ask for `node` to become final.
    ///
    /// Parked on the innermost transaction, deferred until the recording
    /// stack empties, or applied right away.
    pub(crate) fn mark_final(&self, node: Rc<dyn AnyNode>) {
        if let Some(scope) = self.transactions.scopes.borrow_mut().last_mut() {
            scope.finals.push(node);
            return;
        }
        if self.is_evaluating() {
            self.defer_final(node);
            return;
        }
        self.apply_finals(vec![node]);
    }

    /// Finalize a batch of nodes, joining the active transaction if any.
    pub(crate) fn apply_finals(&self, nodes: Vec<Rc<dyn AnyNode>>) {
        if let Some(scope) = self.transactions.scopes.borrow_mut().last_mut() {
            scope.finals.extend(nodes);
            return;
        }

        let committed: Result<(), Infallible> = self.transact(|| {
            for node in &nodes {
                self.apply_final(node);
            }
            Ok(())
        });
        if let Err(never) = committed {
            match never {}
        }
    }

    fn apply_final(&self, node: &Rc<dyn AnyNode>) {
        let id = node.core().id();
        if node.finalize() {
            debug!(node = %id, graph = %self.config().label, "node finalized");
            self.invalidate(id, Freshness::Dirty);
            self.mark_changed(id);
        }
    }

    fn commit(&self) {
        if self.transaction_depth() == 1 {
            self.apply_parked_finals();
        }

        let Some(scope) = self.transactions.scopes.borrow_mut().pop() else {
            return;
        };

        if self.in_transaction() {
            self.merge_into_parent(scope);
            return;
        }

        debug!(
            graph = %self.config().label,
            touched = scope.touched.len(),
            changed = scope.changed.len(),
            "transaction committed"
        );

        let Scope { touched, changed, .. } = scope;
        drop(touched);

        if self.config().flush_disconnects_on_commit {
            self.flush_pending_disconnects();
        }
        self.schedule_reactions(changed);
    }

    fn apply_parked_finals(&self) {
        loop {
            let finals = match self.transactions.scopes.borrow_mut().last_mut() {
                Some(scope) => std::mem::take(&mut scope.finals),
                None => return,
            };
            if finals.is_empty() {
                return;
            }
            for node in &finals {
                self.apply_final(node);
            }
        }
    }

    fn merge_into_parent(&self, child: Scope) {
        let mut superseded = Vec::new();
        {
            let mut scopes = self.transactions.scopes.borrow_mut();
            let Some(parent) = scopes.last_mut() else {
                return;
            };
            for (id, restore) in child.touched {
                if parent.touched.contains_key(&id) {
                    superseded.push(restore);
                } else {
                    parent.touched.insert(id, restore);
                }
            }
            parent.changed.extend(child.changed);
            parent.finals.extend(child.finals);
        }
        drop(superseded);
    }

    fn abort(&self) {
        let Some(scope) = self.transactions.scopes.borrow_mut().pop() else {
            return;
        };

        debug!(
            graph = %self.config().label,
            depth = self.transaction_depth(),
            restored = scope.touched.len(),
            "transaction aborted"
        );

        let Scope { touched, finals, .. } = scope;
        for (_, restore) in touched.into_iter().rev() {
            restore();
        }
        self.release_aborted_finals(finals);
    }

    /// Pass finals parked on an aborted scope outward.
    fn release_aborted_finals(&self, finals: Vec<Rc<dyn AnyNode>>) {
        if finals.is_empty() {
            return;
        }
        if let Some(parent) = self.transactions.scopes.borrow_mut().last_mut() {
            parent.finals.extend(finals);
            return;
        }
        // Unwinding must not run reactors.
        if std::thread::panicking() {
            return;
        }
        if self.is_evaluating() {
            for node in finals {
                self.defer_final(node);
            }
            return;
        }
        self.apply_finals(finals);
    }
}

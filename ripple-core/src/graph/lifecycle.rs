//! Connection Lifecycle
//!
//! A node is connected while something observes it. Connected nodes keep a
//! cache and stay registered on their own dependencies; disconnected nodes
//! hold nothing and recompute on every read.
//!
//! - The 0 -> 1 observer transition connects a node, which in turn registers
//!   it on its dependencies and may connect those.
//! - The 1 -> 0 transition disconnects it, cascading upstream the same way.
//! - An autoCache node is not disconnected on 1 -> 0. It joins a pending batch
//!   instead, and [`Runtime::flush_pending_disconnects`] disconnects whatever in
//!   the batch is still orphaned.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::trace;

use crate::reactive::runtime::Runtime;

use super::node::{AnyNode, NodeId};

/// Deferred disconnects of one graph.
#[derive(Default)]
pub(crate) struct Lifecycle {
    pending: RefCell<IndexMap<NodeId, Weak<dyn AnyNode>>>,
}

impl Runtime {
    /// Register `observer` on `dependency`, connecting it on 0 -> 1.
    pub(crate) fn add_observer(&self, dependency: &Rc<dyn AnyNode>, observer: NodeId) {
        let core = dependency.core();
        let first = core.add_observer(observer);
        trace!(node = %core.id(), observer = %observer, "observer added");

        if first && !core.is_connected() {
            trace!(node = %core.id(), "connecting");
            dependency.connect();
        }
    }

    /// Unregister `observer` from `dependency`, disconnecting it on 1 -> 0.
    pub(crate) fn remove_observer(&self, dependency: &Rc<dyn AnyNode>, observer: NodeId) {
        let core = dependency.core();
        let orphaned = core.remove_observer(observer);
        trace!(node = %core.id(), observer = %observer, "observer removed");

        if !orphaned || !core.is_connected() {
            return;
        }

        if core.is_auto_cached() {
            self.defer_disconnect(dependency);
        } else {
            trace!(node = %core.id(), "disconnecting");
            dependency.disconnect();
        }
    }

    /// Connect an autoCache node that was read while disconnected.
    ///
    /// The node stays connected at least until the next flush.
    pub(crate) fn connect_auto_cached(&self, node: &Rc<dyn AnyNode>) {
        if node.core().is_connected() {
            return;
        }
        trace!(node = %node.core().id(), "connecting auto-cached node");
        node.connect();
        self.defer_disconnect(node);
    }

    fn defer_disconnect(&self, node: &Rc<dyn AnyNode>) {
        trace!(node = %node.core().id(), "disconnect deferred");
        self.lifecycle
            .pending
            .borrow_mut()
            .insert(node.core().id(), Rc::downgrade(node));
    }

    pub(crate) fn pending_disconnects(&self) -> usize {
        self.lifecycle.pending.borrow().len()
    }

    /// Disconnect every deferred node that is still orphaned.
    ///
    /// Disconnecting can orphan further autoCache nodes upstream; those are
    /// handled in the same call. Returns how many nodes were disconnected.
    pub(crate) fn flush_pending_disconnects(&self) -> usize {
        let mut disconnected = 0;
        loop {
            let batch = std::mem::take(&mut *self.lifecycle.pending.borrow_mut());
            if batch.is_empty() {
                break;
            }

            for node in batch.values().filter_map(Weak::upgrade) {
                let core = node.core();
                if core.is_connected() && core.observer_count() == 0 {
                    trace!(node = %core.id(), "disconnecting");
                    node.disconnect();
                    disconnected += 1;
                }
            }
        }
        disconnected
    }
}

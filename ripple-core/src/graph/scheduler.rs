//! Update Scheduler
//!
//! The scheduler spreads staleness through the graph and decides which
//! reactors run after a change.
//!
//! # Algorithm
//!
//! 1. When a node changes, its direct observers are marked with the level the
//!    writer asks for (stale or dirty). Everything further downstream is only
//!    marked "maybe stale".
//! 2. Nothing is recomputed at this point. Derivations are lazy and recompute
//!    on the next read, comparing dependency versions first.
//! 3. When the outermost transaction commits, the set of changed nodes is
//!    walked again and every reactor reached is queued once.
//! 4. The queue is drained in order. A reactor whose run changes more nodes
//!    queues further reactors into the same pass instead of recursing.
//!
//! This "push dirty, pull values" split keeps writes cheap and makes each
//! reactor see a consistent post-transaction graph.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};

use indexmap::IndexSet;
use tracing::error;

use crate::reactive::runtime::Runtime;

use super::node::{Freshness, NodeId, NodeKind};

/// Reactor queue of one graph.
#[derive(Default)]
pub(crate) struct Scheduler {
    queue: RefCell<IndexSet<NodeId>>,
    running: Cell<bool>,
}

/// Clears the running flag even if a reactor panics.
struct PassGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.running.set(false);
    }
}

impl Runtime {
    /// Mark everything downstream of `origin` as needing a check.
    pub(crate) fn invalidate(&self, origin: NodeId, direct: Freshness) {
        let Some(node) = self.lookup(origin) else {
            return;
        };

        let mut visited = HashSet::new();
        let mut queue: VecDeque<(NodeId, Freshness)> = node
            .core()
            .observer_ids()
            .into_iter()
            .map(|id| (id, direct))
            .collect();

        // BFS: direct observers are all queued before anything deeper.
        while let Some((id, level)) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(observer) = self.lookup(id) else {
                continue;
            };

            observer.core().mark(level);
            for next in observer.core().observer_ids() {
                queue.push_back((next, Freshness::MaybeStale));
            }
        }
    }

    /// Queue every reactor downstream of `changed` and drain the queue.
    pub(crate) fn schedule_reactions(&self, changed: IndexSet<NodeId>) {
        if changed.is_empty() {
            return;
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = changed.into_iter().collect();
        let mut reactors = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.lookup(id) else {
                continue;
            };

            if node.core().kind() == NodeKind::Reactor {
                reactors.push(id);
            }
            queue.extend(node.core().observer_ids());
        }

        self.scheduler.queue.borrow_mut().extend(reactors);
        self.run_reactions();
    }

    /// Queue a single reactor, typically for its first evaluation.
    pub(crate) fn schedule_reactor(&self, id: NodeId) {
        self.scheduler.queue.borrow_mut().insert(id);
        self.run_reactions();
    }

    /// Drain the reactor queue unless a pass is already running.
    fn run_reactions(&self) {
        if self.scheduler.running.replace(true) {
            return;
        }
        let _guard = PassGuard {
            scheduler: &self.scheduler,
        };

        let mut budget = self.config().max_reactions_per_pass;
        loop {
            let next = self.scheduler.queue.borrow_mut().shift_remove_index(0);
            let Some(id) = next else {
                break;
            };

            if budget == 0 {
                let dropped = {
                    let mut queue = self.scheduler.queue.borrow_mut();
                    let dropped = queue.len() + 1;
                    queue.clear();
                    dropped
                };
                error!(
                    graph = %self.config().label,
                    budget = self.config().max_reactions_per_pass,
                    dropped,
                    "reaction budget exhausted, dropping queued reactors"
                );
                break;
            }
            budget -= 1;

            if let Some(node) = self.lookup(id) {
                node.react_if_needed();
            }
        }
    }

    pub(crate) fn queued_reactions(&self) -> usize {
        self.scheduler.queue.borrow().len()
    }
}

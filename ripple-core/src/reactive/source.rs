//! Sources
//!
//! A source bridges an external producer (a socket, a timer, a file watcher)
//! into the graph.
//!
//! - Disconnected, a source has nobody to keep informed, so every read simply
//!   pulls a fresh value from [`SourceHooks::calculate`].
//! - Connected, it attaches to the producer through
//!   [`SourceHooks::on_connect`], computes once, and from then on only
//!   recomputes when the host calls [`SourceTrigger::check_for_changes`].
//!   Observers are notified only when the value really changed.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::error::{Error, Result};
use crate::graph::{AnyNode, Freshness, NodeCore, NodeKind};

use super::derivable::Node;
use super::ledger;
use super::runtime::Runtime;
use super::state::{Equality, State};

/// Hooks that connect a source node to its producer.
///
/// Hooks take `&self`; implementations that need to mutate use interior
/// mutability. `calculate` runs outside any recording, so reading other
/// nodes from it does not create dependencies.
pub trait SourceHooks<T>: 'static {
    /// Produce the current value.
    fn calculate(&self) -> Result<T>;

    /// The source gained its first observer. Keep `trigger` to report changes.
    fn on_connect(&self, trigger: SourceTrigger) {
        let _ = trigger;
    }

    /// The source lost its last observer. Detach from the producer.
    fn on_disconnect(&self) {}

    /// Whether [`SourceHooks::accept_new_value`] is supported.
    fn settable(&self) -> bool {
        false
    }

    /// Push a value into the producer. Called by `set` on settable sources.
    fn accept_new_value(&self, value: T) -> Result<()> {
        let _ = value;
        Err(Error::msg("source does not accept values"))
    }
}

/// Handle a producer uses to tell its source node that something changed.
///
/// The handle does not keep the node alive.
#[derive(Clone)]
pub struct SourceTrigger {
    node: Weak<dyn AnyNode>,
}

impl SourceTrigger {
    /// Recompute the source and notify observers if the value changed.
    ///
    /// Does nothing once the node is gone or disconnected.
    pub fn check_for_changes(&self) {
        if let Some(node) = self.node.upgrade() {
            node.check_for_changes();
        }
    }

    /// Whether the source node still exists.
    pub fn is_alive(&self) -> bool {
        self.node.strong_count() > 0
    }
}

/// A node fed by external hooks.
pub(crate) struct Source<T: 'static> {
    core: NodeCore,
    self_ref: Weak<Self>,
    hooks: Box<dyn SourceHooks<T>>,

    /// Last value seen from the producer. Served from while connected; while
    /// disconnected it only anchors version comparisons.
    cache: RefCell<Option<State<T>>>,
    equality: Equality<T>,
}

impl<T: Clone + 'static> Source<T> {
    pub(crate) fn new(
        runtime: &Rc<Runtime>,
        hooks: Box<dyn SourceHooks<T>>,
        equality: Equality<T>,
    ) -> Rc<Self> {
        let source = Rc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(runtime, NodeKind::Source),
            self_ref: self_ref.clone(),
            hooks,
            cache: RefCell::new(None),
            equality,
        });
        runtime.register(&source);
        source
    }

    fn calculate(&self) -> State<T> {
        State::from_result(self.core.runtime().run_independently(|| self.hooks.calculate()))
    }

    /// Store `state` if it differs from the last one. Returns true on change.
    fn store(&self, state: State<T>) -> bool {
        let unchanged = matches!(
            &*self.cache.borrow(),
            Some(previous) if previous.same(&state, &self.equality)
        );
        if unchanged {
            return false;
        }
        *self.cache.borrow_mut() = Some(state);
        self.core.set_version(self.core.runtime().tick());
        true
    }

    fn snapshot(&self) -> Box<dyn FnOnce()> {
        let state = self.cache.borrow().clone();
        let version = self.core.version();
        let source = self.self_ref.clone();

        Box::new(move || {
            if let Some(source) = source.upgrade() {
                *source.cache.borrow_mut() = state;
                source.core.set_version(version);
                source
                    .core
                    .runtime()
                    .invalidate(source.core.id(), Freshness::MaybeStale);
            }
        })
    }
}

impl<T: Clone + 'static> AnyNode for Source<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn connect(&self) {
        if self.core.is_connected() {
            return;
        }
        self.core.set_connected(true);

        let node: Weak<dyn AnyNode> = self.self_ref.clone();
        self.hooks.on_connect(SourceTrigger { node });

        let state = self.calculate();
        self.store(state);
    }

    fn disconnect(&self) {
        if !self.core.is_connected() {
            return;
        }
        self.core.set_connected(false);
        self.hooks.on_disconnect();
    }

    fn check_for_changes(&self) {
        if !self.core.is_connected() {
            return;
        }

        let state = self.calculate();
        let unchanged = matches!(
            &*self.cache.borrow(),
            Some(previous) if previous.same(&state, &self.equality)
        );
        if unchanged {
            return;
        }

        let id = self.core.id();
        let runtime = Rc::clone(self.core.runtime());
        let applied: std::result::Result<(), Infallible> = runtime.atomically(|| {
            runtime.apply_change(id, || self.snapshot());
            if self.store(state) {
                trace!(node = %id, version = self.core.version(), "source changed");
                runtime.invalidate(id, Freshness::MaybeStale);
                runtime.mark_changed(id);
            }
            Ok(())
        });
        if let Err(never) = applied {
            match never {}
        }
    }
}

impl<T: Clone + 'static> Node<T> for Source<T> {
    fn state(&self) -> State<T> {
        if self.core.is_auto_cached() && !self.core.is_connected() {
            if let Some(this) = self.self_ref.upgrade() {
                self.core.runtime().connect_auto_cached(&(this as Rc<dyn AnyNode>));
            }
        }

        let state = if self.core.is_connected() {
            let cached = self.cache.borrow().clone();
            cached.unwrap_or(State::Unresolved)
        } else {
            let state = self.calculate();
            self.store(state.clone());
            state
        };

        ledger::record(&self.self_ref);
        state
    }

    fn equality(&self) -> Equality<T> {
        Rc::clone(&self.equality)
    }

    fn settable(&self) -> bool {
        self.hooks.settable()
    }

    fn set(&self, value: T) -> Result<()> {
        if !self.hooks.settable() {
            return Err(Error::NotSettable(self.core.id()));
        }
        let runtime = Rc::clone(self.core.runtime());
        runtime.transact(|| {
            runtime.run_independently(|| self.hooks.accept_new_value(value))?;
            self.check_for_changes();
            Ok(())
        })
    }
}

impl<T: 'static> Drop for Source<T> {
    fn drop(&mut self) {
        if self.core.is_connected() {
            self.hooks.on_disconnect();
        }
    }
}

//! Reactor Implementation
//!
//! A reactor is a side-effecting subscription: it watches one node and hands
//! each new value to a callback.
//!
//! # How Reactors Work
//!
//! 1. When started, the reactor evaluates immediately, which reads the watched
//!    node (and any gating nodes) inside a recording and so connects them.
//!
//! 2. When an upstream change commits, the scheduler runs the reactor once per
//!    outermost transaction. It re-reads the watched node and fires only if
//!    the value differs from the last one it delivered.
//!
//! 3. The callback runs outside any recording: what it reads does not become
//!    a dependency, and what it writes is committed in its own transaction.
//!
//! # Stopping
//!
//! A reactor stops when its [`Subscription`] is dropped, when `until` turns
//! true, after the first delivery with `once`, when the watched node becomes
//! final, or when the watched node fails and no `on_error` handler is set.
//! Stopping releases every dependency immediately.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::graph::{AnyNode, Freshness, NodeCore, NodeId, NodeKind};

use super::derivable::{Derivable, Node};
use super::ledger::Dependencies;
use super::runtime::Runtime;
use super::state::State;

/// Options for [`Derivable::react_with`](crate::Derivable::react_with).
///
/// ```
/// use ripple_core::{Graph, ReactorOptions};
///
/// let graph = Graph::new();
/// let ready = graph.atom(false);
/// let value = graph.atom(1);
///
/// let _subscription = value.react_with(
///     |v| println!("value is now {v}"),
///     ReactorOptions::new().from(ready.clone()).once(),
/// );
/// ```
#[derive(Default)]
pub struct ReactorOptions {
    once: bool,
    skip_first: bool,
    from: Option<Derivable<bool>>,
    until: Option<Derivable<bool>>,
    when: Option<Derivable<bool>>,
    on_error: Option<Box<dyn FnMut(Error)>>,
    after_shutdown: Option<Box<dyn FnOnce()>>,
}

impl ReactorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the first delivered value.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Do not deliver the first value.
    pub fn skip_first(mut self) -> Self {
        self.skip_first = true;
        self
    }

    /// Start delivering once `from` is true. Checked only until it is.
    pub fn from(mut self, from: Derivable<bool>) -> Self {
        self.from = Some(from);
        self
    }

    /// Stop for good as soon as `until` is true.
    pub fn until(mut self, until: Derivable<bool>) -> Self {
        self.until = Some(until);
        self
    }

    /// Deliver only while `when` is true.
    pub fn when(mut self, when: Derivable<bool>) -> Self {
        self.when = Some(when);
        self
    }

    /// Handle errors from the watched node instead of stopping.
    pub fn on_error(mut self, handler: impl FnMut(Error) + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Run `hook` once the reactor has stopped, for whatever reason.
    pub fn after_shutdown(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.after_shutdown = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for ReactorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorOptions")
            .field("once", &self.once)
            .field("skip_first", &self.skip_first)
            .field("from", &self.from.is_some())
            .field("until", &self.until.is_some())
            .field("when", &self.when.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What one evaluation decided.
enum Decision<T> {
    Stop,
    /// Nothing to deliver. `gated` means `when` closed the gate.
    Idle { gated: bool },
    Deliver { value: T, last: bool },
    Failed(Error),
}

/// Type-erased control surface used by [`Subscription`].
pub(crate) trait ReactorControl {
    fn id(&self) -> NodeId;
    fn is_active(&self) -> bool;
    fn stop(&self);
}

pub(crate) struct Reactor<T> {
    core: NodeCore,
    self_ref: Weak<Self>,
    dependencies: RefCell<Dependencies>,
    watched: Rc<dyn Node<T>>,
    reaction: RefCell<Box<dyn FnMut(T)>>,

    once: bool,
    skip_first: Cell<bool>,
    from: Option<Derivable<bool>>,
    until: Option<Derivable<bool>>,
    when: Option<Derivable<bool>>,
    on_error: RefCell<Option<Box<dyn FnMut(Error)>>>,
    after_shutdown: RefCell<Option<Box<dyn FnOnce()>>>,

    /// `from` has been true at least once.
    started: Cell<bool>,
    active: Cell<bool>,

    /// Last value handed to the reaction.
    last: RefCell<Option<T>>,
}

impl<T: Clone + 'static> Reactor<T> {
    /// Create, root and schedule a reactor.
    pub(crate) fn start(
        runtime: &Rc<Runtime>,
        watched: Rc<dyn Node<T>>,
        reaction: Box<dyn FnMut(T)>,
        options: ReactorOptions,
    ) -> Subscription {
        let started = options.from.is_none();
        let reactor = Rc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(runtime, NodeKind::Reactor),
            self_ref: self_ref.clone(),
            dependencies: RefCell::new(Dependencies::default()),
            watched,
            reaction: RefCell::new(reaction),
            once: options.once,
            skip_first: Cell::new(options.skip_first),
            from: options.from,
            until: options.until,
            when: options.when,
            on_error: RefCell::new(options.on_error),
            after_shutdown: RefCell::new(options.after_shutdown),
            started: Cell::new(started),
            active: Cell::new(true),
            last: RefCell::new(None),
        });

        let id = reactor.core.id();
        reactor.core.set_connected(true);
        runtime.register(&reactor);
        runtime.retain_reactor(Rc::clone(&reactor) as Rc<dyn AnyNode>);
        debug!(node = %id, watched = %reactor.watched.core().id(), "reactor started");

        runtime.schedule_reactor(id);
        Subscription {
            reactor,
            detached: false,
        }
    }

    fn decide(&self) -> Decision<T> {
        if let Some(until) = &self.until {
            if is_true(until) {
                return Decision::Stop;
            }
        }

        if !self.started.get() {
            match &self.from {
                Some(from) if !is_true(from) => return Decision::Idle { gated: false },
                _ => self.started.set(true),
            }
        }

        if let Some(when) = &self.when {
            if !is_true(when) {
                return Decision::Idle { gated: true };
            }
        }

        match self.watched.state() {
            State::Value(value) => Decision::Deliver {
                value,
                last: self.watched.core().is_final(),
            },
            State::Unresolved => Decision::Idle { gated: false },
            State::Error(error) => Decision::Failed(error),
        }
    }

    fn evaluate(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let runtime = Rc::clone(self.core.runtime());

        let decision = {
            let Ok(recording) = runtime.start_recording(this as Rc<dyn AnyNode>) else {
                return;
            };
            let decision = self.decide();
            recording.finish();
            decision
        };
        self.core.set_freshness(Freshness::Fresh);

        match decision {
            Decision::Stop => self.stop(),
            Decision::Idle { gated } => {
                if gated {
                    self.last.borrow_mut().take();
                }
            }
            Decision::Deliver { value, last } => self.deliver(value, last),
            Decision::Failed(error) => self.fail(error),
        }
    }

    fn deliver(&self, value: T, last: bool) {
        let id = self.core.id();

        if self.skip_first.replace(false) {
            trace!(node = %id, "first value skipped");
            *self.last.borrow_mut() = Some(value);
            if last {
                self.stop();
            }
            return;
        }

        let repeated = match &*self.last.borrow() {
            Some(previous) => self.watched.equals(previous, &value),
            None => false,
        };
        if repeated {
            if last {
                self.stop();
            }
            return;
        }
        *self.last.borrow_mut() = Some(value.clone());

        let fired = match self.reaction.try_borrow_mut() {
            Ok(mut reaction) => {
                trace!(node = %id, "reacting");
                self.core.runtime().run_independently(|| (*reaction)(value));
                true
            }
            Err(_) => {
                warn!(node = %id, "reactor invoked while already reacting");
                false
            }
        };

        if (fired && self.once) || last {
            self.stop();
        }
    }

    fn fail(&self, failure: Error) {
        let id = self.core.id();
        self.last.borrow_mut().take();
        let handled = match self.on_error.try_borrow_mut() {
            Ok(mut slot) => match slot.as_mut() {
                Some(handler) => {
                    self.core
                        .runtime()
                        .run_independently(|| handler(failure.clone()));
                    true
                }
                None => false,
            },
            Err(_) => {
                warn!(node = %id, "error handler invoked while already handling");
                true
            }
        };

        if !handled {
            error!(node = %id, error = %failure, "reactor stopped by unhandled error");
            self.stop();
        } else if self.once {
            self.stop();
        }
    }
}

fn is_true(gate: &Derivable<bool>) -> bool {
    matches!(gate.state(), State::Value(true))
}

impl<T: Clone + 'static> ReactorControl for Reactor<T> {
    fn id(&self) -> NodeId {
        self.core.id()
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn stop(&self) {
        if !self.active.replace(false) {
            return;
        }
        let id = self.core.id();
        let runtime = Rc::clone(self.core.runtime());

        let released = self.dependencies.borrow_mut().take();
        for dependency in &released {
            runtime.remove_observer(dependency, id);
        }
        self.core.set_connected(false);
        self.last.borrow_mut().take();
        debug!(node = %id, "reactor stopped");

        let rooted = runtime.release_reactor(id);
        let hook = self.after_shutdown.borrow_mut().take();
        if let Some(hook) = hook {
            runtime.run_independently(hook);
        }
        drop(released);
        drop(rooted);
    }
}

impl<T: Clone + 'static> AnyNode for Reactor<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn connect(&self) {}

    fn disconnect(&self) {}

    fn dependencies(&self) -> Option<&RefCell<Dependencies>> {
        Some(&self.dependencies)
    }

    fn react_if_needed(&self) {
        if !self.active.get() {
            return;
        }

        match self.core.freshness() {
            Freshness::Fresh => return,
            Freshness::MaybeStale => {
                let changed = self.core.runtime().dependencies_changed(&self.dependencies);
                // Refreshing upstream can finalize a dependency and mark us dirty.
                if !changed && self.core.freshness() == Freshness::MaybeStale {
                    self.core.set_freshness(Freshness::Fresh);
                    return;
                }
            }
            Freshness::Dirty => {}
        }
        self.evaluate();
    }
}

/// Handle to a running reactor.
///
/// Dropping the subscription stops the reactor. Call
/// [`Subscription::detach`] to keep it running until one of its own options
/// stops it.
#[must_use = "dropping a Subscription stops the reactor immediately"]
pub struct Subscription {
    reactor: Rc<dyn ReactorControl>,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> NodeId {
        self.reactor.id()
    }

    /// Whether the reactor is still running.
    pub fn is_active(&self) -> bool {
        self.reactor.is_active()
    }

    /// Stop the reactor now.
    pub fn unsubscribe(self) {
        self.reactor.stop();
    }

    /// Let the reactor outlive this handle.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.reactor.stop();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.reactor.id())
            .field("active", &self.reactor.is_active())
            .field("detached", &self.detached)
            .finish()
    }
}

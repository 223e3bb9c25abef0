//! Derivation Implementation
//!
//! A derivation is a value computed from other nodes. It caches its result
//! and re-evaluates only when one of its dependencies changes.
//!
//! # How Derivations Work
//!
//! 1. A derivation is inert until read. Reading it runs the deriver inside a
//!    recording session, which captures exactly the nodes the deriver reads.
//!
//! 2. While connected (something observes it), the result is cached and the
//!    derivation stays registered on its dependencies. A change upstream marks
//!    it stale; the next read compares dependency versions and recomputes only
//!    if one actually moved.
//!
//! 3. While disconnected, nothing is cached and every read recomputes.
//!
//! 4. Once every dependency it read is final, the derivation becomes final
//!    too, keeps its last result forever and lets go of its dependencies.
//!
//! # Errors
//!
//! A failing deriver stores its error as the node's state, and every read
//! hands it back until a recomputation produces something else. Reading a
//! derivation from inside its own evaluation fails with a cycle error.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::graph::{AnyNode, Freshness, NodeCore, NodeKind};

use super::derivable::Node;
use super::ledger::{self, Dependencies};
use super::runtime::Runtime;
use super::state::{Equality, State};

pub(crate) type Deriver<T> = Box<dyn Fn() -> Result<T>>;
pub(crate) type Setter<T> = Box<dyn Fn(T) -> Result<()>>;

/// A computed node, optionally with a write path (a lens).
pub(crate) struct Derivation<T> {
    core: NodeCore,
    self_ref: Weak<Self>,

    /// Last result. Only trusted while connected or final.
    cache: RefCell<Option<State<T>>>,

    dependencies: RefCell<Dependencies>,
    deriver: Deriver<T>,
    setter: Option<Setter<T>>,
    equality: Equality<T>,
}

impl<T: Clone + 'static> Derivation<T> {
    pub(crate) fn new(
        runtime: &Rc<Runtime>,
        deriver: Deriver<T>,
        equality: Equality<T>,
    ) -> Rc<Self> {
        Self::build(runtime, NodeKind::Derivation, deriver, None, equality)
    }

    pub(crate) fn build(
        runtime: &Rc<Runtime>,
        kind: NodeKind,
        deriver: Deriver<T>,
        setter: Option<Setter<T>>,
        equality: Equality<T>,
    ) -> Rc<Self> {
        let derivation = Rc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(runtime, kind),
            self_ref: self_ref.clone(),
            cache: RefCell::new(None),
            dependencies: RefCell::new(Dependencies::default()),
            deriver,
            setter,
            equality,
        });
        runtime.register(&derivation);
        derivation
    }

    fn recompute(&self) -> Result<()> {
        let Some(this) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let id = self.core.id();
        let runtime = Rc::clone(self.core.runtime());

        trace!(node = %id, "recomputing");
        let recording = runtime.start_recording(Rc::clone(&this) as Rc<dyn AnyNode>)?;
        let result = (self.deriver)();
        let all_final = recording.finish();

        let state = State::from_result(result);
        let changed = !matches!(
            &*self.cache.borrow(),
            Some(previous) if previous.same(&state, &self.equality)
        );
        if changed {
            *self.cache.borrow_mut() = Some(state);
            self.core.set_version(runtime.tick());
        }
        self.core.set_freshness(Freshness::Fresh);

        if all_final {
            runtime.mark_final(this);
        }
        Ok(())
    }
}

impl<T: Clone + 'static> AnyNode for Derivation<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn connect(&self) {
        if self.core.is_connected() {
            return;
        }
        self.core.set_connected(true);
        if self.core.is_final() {
            return;
        }

        // Upstream may have moved while nothing was listening.
        self.core.mark(Freshness::MaybeStale);
        let id = self.core.id();
        let dependencies = self.dependencies.borrow().snapshot();
        for dependency in &dependencies {
            self.core.runtime().add_observer(dependency, id);
        }
    }

    fn disconnect(&self) {
        if !self.core.is_connected() {
            return;
        }
        self.core.set_connected(false);
        if self.core.is_final() {
            return;
        }

        let stale = self.cache.borrow_mut().take();
        self.core.set_freshness(Freshness::Dirty);

        let id = self.core.id();
        let dependencies = self.dependencies.borrow().snapshot();
        for dependency in &dependencies {
            self.core.runtime().remove_observer(dependency, id);
        }
        drop(stale);
    }

    fn refresh(&self) -> Result<()> {
        let id = self.core.id();
        if self.core.is_final() && self.cache.borrow().is_some() {
            return Ok(());
        }
        if self.core.runtime().is_recording(id) {
            warn!(node = %id, "derivation read during its own evaluation");
            return Err(Error::Cycle(id));
        }

        let cached = self.cache.borrow().is_some();
        if self.core.is_connected() && cached {
            match self.core.freshness() {
                Freshness::Fresh => return Ok(()),
                Freshness::MaybeStale => {
                    let changed = self.core.runtime().dependencies_changed(&self.dependencies);
                    if !changed && self.core.freshness() == Freshness::MaybeStale {
                        self.core.set_freshness(Freshness::Fresh);
                        return Ok(());
                    }
                }
                Freshness::Dirty => {}
            }
        }

        self.recompute()
    }

    fn finalize(&self) -> bool {
        if self.core.is_final() {
            return true;
        }

        let qualifies = {
            let dependencies = self.dependencies.borrow();
            !dependencies.is_empty() && dependencies.all_final()
        };
        if !qualifies {
            return false;
        }

        self.core.set_final(true);
        let id = self.core.id();
        let released = self.dependencies.borrow_mut().take();
        if self.core.is_connected() {
            for dependency in &released {
                self.core.runtime().remove_observer(dependency, id);
            }
        }
        debug!(node = %id, released = released.len(), "derivation finalized");
        true
    }

    fn dependencies(&self) -> Option<&RefCell<Dependencies>> {
        Some(&self.dependencies)
    }
}

impl<T: Clone + 'static> Node<T> for Derivation<T> {
    fn state(&self) -> State<T> {
        if self.core.is_auto_cached() && !self.core.is_connected() {
            if let Some(this) = self.self_ref.upgrade() {
                self.core.runtime().connect_auto_cached(&(this as Rc<dyn AnyNode>));
            }
        }

        if let Err(error) = self.refresh() {
            return State::Error(error);
        }

        let state = self.cache.borrow().clone().unwrap_or(State::Unresolved);
        ledger::record(&self.self_ref);
        state
    }

    fn equality(&self) -> Equality<T> {
        Rc::clone(&self.equality)
    }

    fn settable(&self) -> bool {
        self.setter.is_some()
    }

    fn set(&self, value: T) -> Result<()> {
        let Some(setter) = &self.setter else {
            return Err(Error::NotSettable(self.core.id()));
        };
        trace!(node = %self.core.id(), "lens write");
        let runtime = Rc::clone(self.core.runtime());
        runtime.transact(|| runtime.run_independently(|| setter(value)))
    }
}

impl<T> Drop for Derivation<T> {
    fn drop(&mut self) {
        if !self.core.is_connected() {
            return;
        }
        let id = self.core.id();
        let runtime = Rc::clone(self.core.runtime());
        for dependency in self.dependencies.get_mut().take() {
            runtime.remove_observer(&dependency, id);
        }
    }
}

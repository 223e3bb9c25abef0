//! Derivables
//!
//! [`Derivable`] is the one handle type every node is used through. What a
//! handle can do depends on the node behind it: every node can be read,
//! derived from and reacted to, while only atoms, lenses and settable sources
//! accept `set`.
//!
//! # Example
//!
//! ```
//! use ripple_core::Graph;
//!
//! let graph = Graph::new();
//! let first = graph.atom("Ada".to_string());
//! let last = graph.atom("Lovelace".to_string());
//! let full = first.derive_with(last.clone(), |first, last| Ok(format!("{first} {last}")));
//!
//! assert_eq!(full.get().unwrap(), "Ada Lovelace");
//! last.set("Byron".to_string()).unwrap();
//! assert_eq!(full.get().unwrap(), "Ada Byron");
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::graph::{AnyNode, NodeId, NodeKind};

use super::derivation::Derivation;
use super::lens;
use super::reactor::{Reactor, ReactorOptions, Subscription};
use super::runtime::Graph;
use super::state::{default_equality, equals, Equality, State};

/// Typed behaviour of a node.
pub(crate) trait Node<T>: AnyNode {
    /// Current state. Records the read in the innermost recording session.
    fn state(&self) -> State<T>;

    fn equality(&self) -> Equality<T>;

    fn equals(&self, a: &T, b: &T) -> bool {
        equals(&self.equality(), a, b)
    }

    fn settable(&self) -> bool {
        false
    }

    fn set(&self, value: T) -> Result<()> {
        let _ = value;
        Err(Error::NotSettable(self.core().id()))
    }

    /// Replace the state, optionally making the node final. Atoms only.
    fn write(&self, state: State<T>, make_final: bool) -> Result<()> {
        let _ = (state, make_final);
        Err(Error::NotSettable(self.core().id()))
    }
}

/// Handle to a node of a [`Graph`].
///
/// Cloning the handle is cheap and refers to the same node. The node lives as
/// long as any handle to it, or any node derived from it, is alive.
pub struct Derivable<T> {
    node: Rc<dyn Node<T>>,
}

impl<T> Clone for Derivable<T> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<T: Clone + 'static> Derivable<T> {
    pub(crate) fn from_node<N: Node<T> + 'static>(node: Rc<N>) -> Self {
        Self { node }
    }

    fn runtime(&self) -> &Rc<super::runtime::Runtime> {
        self.node.core().runtime()
    }

    /// The graph this node belongs to.
    pub fn graph(&self) -> Graph {
        Graph::from_runtime(Rc::clone(self.runtime()))
    }

    /// Read the value.
    ///
    /// Inside a deriver or reactor this also records the node as a
    /// dependency. An unresolved node returns `Err(Error::Unresolved)`; an
    /// errored node returns its cached error.
    pub fn get(&self) -> Result<T> {
        self.node.state().into_result()
    }

    /// Read the full tri-state.
    pub fn state(&self) -> State<T> {
        self.node.state()
    }

    /// Write a new value. Fails with [`Error::NotSettable`] for nodes without a
    /// write path.
    pub fn set(&self, value: T) -> Result<()> {
        self.node.set(value)
    }

    /// `set(f(get()))`, as one atomic step.
    ///
    /// The read is not tracked, so swapping from inside a deriver does not
    /// make the node a dependency.
    pub fn swap(&self, f: impl FnOnce(T) -> T) -> Result<()> {
        let runtime = Rc::clone(self.runtime());
        runtime.atomically(|| {
            let current = runtime.run_independently(|| self.get())?;
            self.set(f(current))
        })
    }

    /// [`Derivable::swap`] with node arguments, read alongside the current
    /// value and unwrapped before `f` runs.
    pub fn swap_with<A: DeriveArgs>(
        &self,
        args: A,
        f: impl FnOnce(T, A::Values) -> T,
    ) -> Result<()> {
        let runtime = Rc::clone(self.runtime());
        runtime.atomically(|| {
            let (current, values) =
                runtime.run_independently(|| Ok::<_, Error>((self.get()?, args.values()?)))?;
            self.set(f(current, values))
        })
    }

    /// Return an atom to the unresolved state.
    pub fn unset(&self) -> Result<()> {
        self.node.write(State::Unresolved, false)
    }

    /// Write a last value and make the atom final.
    pub fn set_final(&self, value: T) -> Result<()> {
        self.node.write(State::Value(value), true)
    }

    /// Make the atom final with its current state.
    pub fn make_final(&self) -> Result<()> {
        let current = self.runtime().run_independently(|| self.node.state());
        self.node.write(current, true)
    }

    pub fn is_settable(&self) -> bool {
        self.node.settable()
    }

    /// Derive a new node from this one's value.
    pub fn derive<U: Clone + PartialEq + 'static>(
        &self,
        f: impl Fn(T) -> Result<U> + 'static,
    ) -> Derivable<U> {
        let base = self.clone();
        self.graph().derive(move || f(base.get()?))
    }

    /// Derive from this node plus further node arguments.
    ///
    /// The arguments are unwrapped before `f` runs.
    pub fn derive_with<A, U>(
        &self,
        args: A,
        f: impl Fn(T, A::Values) -> Result<U> + 'static,
    ) -> Derivable<U>
    where
        A: DeriveArgs,
        U: Clone + PartialEq + 'static,
    {
        let base = self.clone();
        self.graph().derive(move || f(base.get()?, args.values()?))
    }

    /// Derive with an infallible function.
    pub fn map<U: Clone + PartialEq + 'static>(
        &self,
        f: impl Fn(T) -> U + 'static,
    ) -> Derivable<U> {
        self.derive(move |value| Ok(f(value)))
    }

    /// Like [`Derivable::map`], but writable when this node is: setting the
    /// result sets this node to `reverse(value)`.
    pub fn map_with_reverse<U: Clone + PartialEq + 'static>(
        &self,
        f: impl Fn(T) -> U + 'static,
        reverse: impl Fn(U) -> T + 'static,
    ) -> Derivable<U> {
        self.lens(move |value| Ok(f(value)), move |_, value| Ok(reverse(value)))
    }

    /// A two-way view of this node.
    ///
    /// `put` receives the current value of this node and the value being set,
    /// and returns the new value for this node. When this node is not
    /// settable, the result is a plain derivation.
    pub fn lens<U: Clone + PartialEq + 'static>(
        &self,
        get: impl Fn(T) -> Result<U> + 'static,
        put: impl Fn(T, U) -> Result<T> + 'static,
    ) -> Derivable<U> {
        if !self.is_settable() {
            return self.derive(get);
        }

        let reader = self.clone();
        let writer = self.clone();
        Derivable::from_node(lens::new(
            self.runtime(),
            Box::new(move || get(reader.get()?)),
            Box::new(move |value| {
                let current = writer.get()?;
                writer.set(put(current, value)?)
            }),
            default_equality(),
        ))
    }

    /// Replace an unresolved state with `fallback`.
    pub fn fallback_to(&self, fallback: T) -> Derivable<T> {
        let base = self.clone();
        Derivable::from_node(Derivation::new(
            self.runtime(),
            Box::new(move || match base.get() {
                Err(Error::Unresolved) => Ok(fallback.clone()),
                other => other,
            }),
            self.node.equality(),
        ))
    }

    /// Keep the node connected for one tick after it loses its last
    /// observer, and connect it when it is read without one.
    ///
    /// Returns the same node. The deferred disconnects run on
    /// [`Graph::flush_pending_disconnects`].
    pub fn auto_cache(&self) -> Self {
        self.node.core().set_auto_cache(true);
        self.clone()
    }

    /// Call `reaction` with the current value now and with every new value
    /// after each committed change.
    pub fn react(&self, reaction: impl FnMut(T) + 'static) -> Subscription {
        self.react_with(reaction, ReactorOptions::default())
    }

    pub fn react_with(
        &self,
        reaction: impl FnMut(T) + 'static,
        options: ReactorOptions,
    ) -> Subscription {
        Reactor::start(self.runtime(), Rc::clone(&self.node), Box::new(reaction), options)
    }

    /// Resolve with the first value the node delivers under `options`.
    ///
    /// The reactor is forced to `once`. An error from the node resolves the
    /// future with that error; a reactor that stops without delivering (for
    /// example through `until`) resolves it with [`Error::ReactorStopped`].
    /// The returned future does not need to be polled for the reactor to run.
    pub fn to_promise(&self, options: ReactorOptions) -> impl Future<Output = Result<T>> {
        let (sender, receiver) = oneshot::channel();
        let sender = Rc::new(RefCell::new(Some(sender)));

        let on_error = Rc::clone(&sender);
        let options = options.once().on_error(move |error| {
            if let Some(sender) = on_error.borrow_mut().take() {
                let _ = sender.send(Err(error));
            }
        });

        self.react_with(
            move |value| {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(Ok(value));
                }
            },
            options,
        )
        .detach();

        async move { receiver.await.unwrap_or(Err(Error::ReactorStopped)) }
    }

    /// Poll the source behind this handle. A no-op for other kinds.
    pub fn check_for_changes(&self) {
        self.node.check_for_changes();
    }

    pub fn id(&self) -> NodeId {
        self.node.core().id()
    }

    pub fn kind(&self) -> NodeKind {
        self.node.core().kind()
    }

    /// Version of the node's state. Moves only on actual changes.
    pub fn version(&self) -> u64 {
        self.node.core().version()
    }

    pub fn is_connected(&self) -> bool {
        self.node.core().is_connected()
    }

    pub fn is_final(&self) -> bool {
        self.node.core().is_final()
    }

    pub fn is_auto_cached(&self) -> bool {
        self.node.core().is_auto_cached()
    }

    pub fn observer_count(&self) -> usize {
        self.node.core().observer_count()
    }

    /// Ids of the nodes read during the last evaluation, in first-read order.
    pub fn dependencies(&self) -> Vec<NodeId> {
        self.node
            .dependencies()
            .map(|dependencies| dependencies.borrow().ids())
            .unwrap_or_default()
    }

    /// Number of dependencies recorded at the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.node
            .dependencies()
            .map(|dependencies| dependencies.borrow().len())
            .unwrap_or(0)
    }

    /// Untracked check for a resolved value.
    pub fn is_resolved(&self) -> bool {
        self.untracked_state().is_resolved()
    }

    pub fn is_errored(&self) -> bool {
        self.untracked_state().is_errored()
    }

    /// The error the node currently holds, if any. Untracked.
    pub fn error(&self) -> Option<Error> {
        match self.untracked_state() {
            State::Error(error) => Some(error),
            _ => None,
        }
    }

    fn untracked_state(&self) -> State<T> {
        self.runtime().run_independently(|| self.node.state())
    }
}

impl<T> fmt::Debug for Derivable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.node.core();
        f.debug_struct("Derivable")
            .field("id", &core.id())
            .field("kind", &core.kind())
            .field("version", &core.version())
            .field("connected", &core.is_connected())
            .field("final", &core.is_final())
            .finish()
    }
}

/// Node arguments for [`Graph::derive_with`] and [`Derivable::derive_with`].
///
/// Implemented for a single [`Derivable`] and for tuples of up to four
/// arguments. `values` reads every argument, so each becomes a dependency.
pub trait DeriveArgs: 'static {
    type Values;

    fn values(&self) -> Result<Self::Values>;
}

impl<T: Clone + 'static> DeriveArgs for Derivable<T> {
    type Values = T;

    fn values(&self) -> Result<T> {
        self.get()
    }
}

macro_rules! impl_derive_args {
    ($($name:ident),+) => {
        impl<$($name: DeriveArgs),+> DeriveArgs for ($($name,)+) {
            type Values = ($($name::Values,)+);

            #[allow(non_snake_case)]
            fn values(&self) -> Result<Self::Values> {
                let ($($name,)+) = self;
                Ok(($($name.values()?,)+))
            }
        }
    };
}

impl_derive_args!(A);
impl_derive_args!(A, B);
impl_derive_args!(A, B, C);
impl_derive_args!(A, B, C, D);

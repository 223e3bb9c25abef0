//! Reactive Primitives
//!
//! This module implements the node variants and the machinery that keeps
//! them consistent: recording, transactions and reactors.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is a container for mutable state. When an atom is read inside a
//! derivation or reactor, the read is recorded and the reader becomes an
//! observer of the atom. When the atom changes, observers are marked stale.
//!
//! ## Derivations
//!
//! A derivation is a cached pure function of other nodes. It re-evaluates
//! only when one of the dependencies it actually read has a new version.
//! Lenses are derivations with a write path; plucking builds a lens over one
//! entry of a collection.
//!
//! ## Sources
//!
//! A source wraps an external producer. It pulls on every read while nobody
//! observes it and is pushed to through a [`SourceTrigger`] once connected.
//!
//! ## Reactors
//!
//! A reactor runs a side effect with each new value of the node it watches,
//! after the outermost transaction commits. It lives until its
//! [`Subscription`] is dropped or unsubscribed.
//!
//! # Implementation Notes
//!
//! Dependencies are detected automatically: each evaluation runs inside a
//! recording session, and every read reports itself to the innermost one.
//! Recorded dependencies are reconciled against the previous evaluation so a
//! node that is read again keeps its observer registration.

mod atom;
mod constant;
mod derivable;
mod derivation;
pub(crate) mod ledger;
mod lens;
mod pluck;
mod reactor;
pub(crate) mod runtime;
mod source;
mod state;
mod transaction;

pub use derivable::{Derivable, DeriveArgs};
pub use pluck::Pluckable;
pub use reactor::{ReactorOptions, Subscription};
pub use runtime::Graph;
pub use source::{SourceHooks, SourceTrigger};
pub use state::{Equality, State};

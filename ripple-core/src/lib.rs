//! Ripple Core
//!
//! This crate provides the engine behind Ripple, an incremental computation
//! graph. It implements:
//!
//! - Reactive nodes (atoms, constants, derivations, lenses, sources)
//! - Automatic dependency tracking with exact, minimal dependency sets
//! - Nested transactions with rollback
//! - Reactors that run side effects once per committed change
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: node identity, the connect/disconnect lifecycle and the
//!   scheduler
//! - `reactive`: the node variants, the recording ledger, transactions and
//!   reactors
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use ripple_core::Graph;
//!
//! let graph = Graph::new();
//!
//! // Create an atom
//! let count = graph.atom(0);
//!
//! // Create a derived value
//! let doubled = count.map(|n| n * 2);
//!
//! // React to it
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = Rc::clone(&seen);
//! let _subscription = doubled.react(move |n| log.borrow_mut().push(n));
//!
//! // Update the atom
//! count.set(5).unwrap();
//! assert_eq!(*seen.borrow(), vec![0, 10]);
//! ```

mod config;
mod error;
pub mod graph;
pub mod reactive;

pub use config::GraphConfig;
pub use error::{Error, Result};
pub use graph::{NodeId, NodeKind};
pub use reactive::{
    Derivable, DeriveArgs, Equality, Graph, Pluckable, ReactorOptions, SourceHooks, SourceTrigger,
    State, Subscription,
};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

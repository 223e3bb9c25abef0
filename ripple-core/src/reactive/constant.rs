//! Constant Implementation
//!
//! A constant is final from the moment it exists. Reads are still recorded,
//! which is what lets a derivation over constants notice that it can never
//! change either.

use std::rc::{Rc, Weak};

use crate::graph::{AnyNode, NodeCore, NodeKind};

use super::derivable::Node;
use super::ledger;
use super::runtime::Runtime;
use super::state::{identity_equality, Equality, State};

/// An immutable leaf node.
pub(crate) struct Constant<T> {
    core: NodeCore,
    self_ref: Weak<Self>,
    value: T,
}

impl<T: Clone + 'static> Constant<T> {
    pub(crate) fn new(runtime: &Rc<Runtime>, value: T) -> Rc<Self> {
        let constant = Rc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(runtime, NodeKind::Constant),
            self_ref: self_ref.clone(),
            value,
        });
        constant.core.set_final(true);
        runtime.register(&constant);
        constant
    }
}

impl<T: Clone + 'static> AnyNode for Constant<T> {
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

impl<T: Clone + 'static> Node<T> for Constant<T> {
    fn state(&self) -> State<T> {
        ledger::record(&self.self_ref);
        State::Value(self.value.clone())
    }

    fn equality(&self) -> Equality<T> {
        identity_equality()
    }
}

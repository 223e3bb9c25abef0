//! Lenses
//!
//! A lens is a derivation with a write path. Reads behave exactly like a
//! derivation; `set` hands the value to a user setter, which usually writes
//! one or more upstream atoms. The setter runs in its own transaction, so a
//! failing setter leaves nothing half-written, and outside any recording, so
//! the reads it makes never become dependencies of whatever called `set`.

use std::rc::Rc;

use crate::graph::NodeKind;

use super::derivation::{Derivation, Deriver, Setter};
use super::runtime::Runtime;
use super::state::Equality;

pub(crate) fn new<T: Clone + 'static>(
    runtime: &Rc<Runtime>,
    getter: Deriver<T>,
    setter: Setter<T>,
    equality: Equality<T>,
) -> Rc<Derivation<T>> {
    Derivation::build(runtime, NodeKind::Lens, getter, Some(setter), equality)
}

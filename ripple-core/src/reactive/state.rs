//! Node State
//!
//! Every node is in one of three states: it has a value, it has no value yet,
//! or it failed. Finality ("this will never change again") is tracked on the
//! node itself, not here.

use std::rc::Rc;

use crate::error::{Error, Result};

/// The tri-state value model.
#[derive(Debug, Clone, PartialEq)]
pub enum State<T> {
    /// A resolved value.
    Value(T),

    /// No value yet.
    Unresolved,

    /// Evaluation failed. The error is returned from every read until a
    /// recomputation produces something else.
    Error(Error),
}

impl<T> State<T> {
    /// Convert a deriver result. `Err(Error::Unresolved)` becomes
    /// [`State::Unresolved`].
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(Error::Unresolved) => Self::Unresolved,
            Err(error) => Self::Error(error),
        }
    }

    /// Convert to a result. An unresolved state becomes `Err(Error::Unresolved)`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Unresolved => Err(Error::Unresolved),
            Self::Error(error) => Err(error),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Map the value, keeping the other states as they are.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> State<U> {
        match self {
            Self::Value(value) => State::Value(f(value)),
            Self::Unresolved => State::Unresolved,
            Self::Error(error) => State::Error(error),
        }
    }

    /// Whether two states are the same under a node's equality.
    pub(crate) fn same(&self, other: &Self, equality: &Equality<T>) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => equals(equality, a, b),
            (Self::Unresolved, Self::Unresolved) => true,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> From<Result<T>> for State<T> {
    fn from(result: Result<T>) -> Self {
        Self::from_result(result)
    }
}

/// Structural equality hook of a node.
pub type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

pub(crate) fn default_equality<T: PartialEq + 'static>() -> Equality<T> {
    Rc::new(|a: &T, b: &T| a == b)
}

/// Equality that only holds for the very same value.
pub(crate) fn identity_equality<T: 'static>() -> Equality<T> {
    Rc::new(|_: &T, _: &T| false)
}

/// Identity short-circuit, then the hook.
pub(crate) fn equals<T>(equality: &Equality<T>, a: &T, b: &T) -> bool {
    std::ptr::eq(a, b) || equality(a, b)
}

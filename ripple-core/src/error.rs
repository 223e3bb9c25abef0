//! Error types for the engine.
//!
//! Errors are values in the graph: a deriver that fails stores its error as
//! the node's state, and every later read hands the same error back. That is
//! why [`Error`] is cheap to clone and comparable.

use std::error::Error as StdError;
use std::rc::Rc;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while reading or writing a node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The node has no value yet.
    ///
    /// Derivers propagate this with `?`, which makes the derived node
    /// unresolved as well.
    #[error("derivable is unresolved")]
    Unresolved,

    /// `set` was called on a node without a write path.
    #[error("node {0} is not settable")]
    NotSettable(NodeId),

    /// The node is final and refuses further changes.
    #[error("node {0} is final and cannot change")]
    Finalized(NodeId),

    /// The node was read while its own evaluation was in progress.
    #[error("cyclic dependency: node {0} was read during its own evaluation")]
    Cycle(NodeId),

    /// A plucked key does not exist in the current value.
    #[error("key not found in plucked value")]
    KeyNotFound,

    /// A reactor stopped before it delivered a value.
    #[error("reactor stopped before producing a value")]
    ReactorStopped,

    /// Free-form failure raised by user code.
    #[error("{0}")]
    Message(Rc<str>),

    /// A user error wrapped for storage in the graph.
    #[error("{0}")]
    Custom(Rc<dyn StdError>),
}

impl Error {
    /// Build an error from a message.
    pub fn msg(message: impl AsRef<str>) -> Self {
        Self::Message(Rc::from(message.as_ref()))
    }

    /// Wrap an arbitrary error.
    pub fn custom(error: impl StdError + 'static) -> Self {
        Self::Custom(Rc::new(error))
    }

    /// True for [`Error::Unresolved`].
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unresolved, Self::Unresolved)
            | (Self::KeyNotFound, Self::KeyNotFound)
            | (Self::ReactorStopped, Self::ReactorStopped) => true,
            (Self::NotSettable(a), Self::NotSettable(b))
            | (Self::Finalized(a), Self::Finalized(b))
            | (Self::Cycle(a), Self::Cycle(b)) => a == b,
            (Self::Message(a), Self::Message(b)) => a == b,
            // User errors carry no equality of their own; identity is all we have.
            (Self::Custom(a), Self::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl StdError for Boom {}

    #[test]
    fn messages_compare_by_content() {
        assert_eq!(Error::msg("nope"), Error::msg("nope"));
        assert_ne!(Error::msg("nope"), Error::msg("yes"));
    }

    #[test]
    fn custom_errors_compare_by_identity() {
        let a = Error::custom(Boom);
        let b = Error::custom(Boom);

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn node_errors_name_the_node() {
        let id = NodeId::from_raw(7);
        assert_eq!(Error::NotSettable(id).to_string(), "node #7 is not settable");
        assert_eq!(Error::Cycle(id), Error::Cycle(id));
        assert_ne!(Error::Cycle(id), Error::Finalized(id));
    }
}

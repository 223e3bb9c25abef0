//! Graph configuration.
//!
//! A [`GraphConfig`] is handed to [`Graph::with_config`](crate::Graph::with_config).
//! Every field has a default, so hosts only spell out what they change, and
//! the struct deserializes from whatever format the host already uses for
//! its settings.

use serde::{Deserialize, Serialize};

/// Tunables for one [`Graph`](crate::Graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Label attached to tracing events emitted by this graph.
    pub label: String,

    /// Maximum number of reactor runs in a single notification pass.
    ///
    /// Reactors that write to the nodes they watch can keep re-triggering
    /// each other. Once the budget is spent the remaining queue is dropped
    /// and an error is logged.
    pub max_reactions_per_pass: usize,

    /// Flush deferred autoCache disconnects whenever the outermost
    /// transaction commits.
    ///
    /// Meant for hosts without a natural tick boundary to call
    /// [`Graph::flush_pending_disconnects`](crate::Graph::flush_pending_disconnects) from.
    pub flush_disconnects_on_commit: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            label: "graph".to_string(),
            max_reactions_per_pass: 10_000,
            flush_disconnects_on_commit: false,
        }
    }
}

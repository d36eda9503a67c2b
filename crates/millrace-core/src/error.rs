//! Terminal flow errors.
//!
//! A [`FlowError`] ends the flow: the dispatcher marks it failed and does
//! not re-enqueue. Transient storage or queue errors are *not* represented
//! here -- they propagate as plain `anyhow` errors, the tick aborts, and
//! the queue's redelivery semantics retry the same snapshot.

use thiserror::Error;

/// Errors that terminate a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    /// No fallback is registered for the current combination of failed
    /// nodes. Raised once all in-flight nodes have settled.
    #[error("no fallback for failure {nodes:?} in flow {flow:?}")]
    NoFallback { flow: String, nodes: Vec<String> },

    /// The flow name is not present in the registry. This is a
    /// configuration error: the snapshot references a flow the registry
    /// was never compiled with.
    #[error("flow {0:?} is not present in the registry")]
    UnknownFlow(String),

    /// The flow has no start edges, so it can never schedule anything.
    /// The flow definition compiler rejects such flows; hitting this at
    /// runtime means the registry was built by hand and mis-compiled.
    #[error("flow {0:?} has no start edge")]
    NoStartEdge(String),

    /// An armed edge index points outside the flow's edge table. The
    /// snapshot and the registry disagree about the flow's shape.
    #[error("edge index {index} is out of bounds for flow {flow:?}")]
    EdgeIndexOutOfBounds { flow: String, index: usize },
}

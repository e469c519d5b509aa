//! Node-level error types.

use thiserror::Error;

/// Errors returned by a node body's `execute` method.
///
/// Every variant is retryable from the wrapper's point of view: an attempt
/// that fails with a `NodeError` is re-run while the node's retry budget
/// lasts. The variant only decides the `<kind>` rendered into the
/// `ERR(<kind>)` trace event.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Failure with a caller-chosen kind, e.g. `NodeError::failed("Upstream", "503")`.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else a node body propagated with `?`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    /// Shorthand for [`NodeError::Failed`].
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The kind rendered in `ERR(<kind>)` trace events.
    pub fn kind(&self) -> &str {
        match self {
            Self::Failed { kind, .. } => kind,
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Other(_) => "Other",
        }
    }
}

/// Errors raised while defining or registering a node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// Two nodes share the same name within one registry.
    #[error("duplicate node name: '{0}' is already registered")]
    DuplicateName(String),

    /// The name cannot be referenced from the DSL.
    #[error("invalid node name '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidName(String),

    /// A timeout must be strictly positive when present.
    #[error("node '{0}' has a zero timeout")]
    ZeroTimeout(String),
}

/// A node kept failing with an error until its retry budget ran out.
///
/// This is the only execution-time failure that aborts an evaluation branch;
/// timeouts and `false` returns resolve to a boolean instead.
#[derive(Debug, Error)]
#[error("node '{node}' failed after {attempts} attempt(s): {source}")]
pub struct ExecutionError {
    pub node: String,
    pub attempts: u32,
    #[source]
    pub source: NodeError,
}

impl ExecutionError {
    pub fn kind(&self) -> &str {
        self.source.kind()
    }
}

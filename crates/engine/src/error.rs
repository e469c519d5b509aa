//! Engine-level error types.

use nodes::ExecutionError;
use thiserror::Error;

/// Malformed DSL text. Always raised before any node executes.
///
/// Positions are byte offsets into the input string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedCharacter { ch: char, position: usize },

    #[error("unmatched opening parenthesis at position {position}")]
    UnmatchedOpen { position: usize },

    #[error("unmatched closing parenthesis at position {position}")]
    UnmatchedClose { position: usize },

    /// `<N>` where N is missing, zero, not a number, or out of range.
    #[error("invalid loop count '{text}' at position {position}: expected a positive integer")]
    InvalidLoopCount { text: String, position: usize },

    #[error("expected a node name or '(' at position {position}, found '{found}'")]
    ExpectedOperand { found: String, position: usize },

    #[error("unexpected end of expression: expected a node name or '('")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at position {position} after a complete expression")]
    TrailingInput { found: String, position: usize },

    #[error("expression nests deeper than {limit} levels at position {position}")]
    TooDeep { limit: usize, position: usize },
}

/// Errors produced by the flow engine (compilation + evaluation).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Compilation errors ------

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The DSL references a node name absent from the registry.
    #[error("unknown node '{name}'; registered nodes: [{}]", .registered.join(", "))]
    UnknownNode {
        name: String,
        registered: Vec<String>,
    },

    // ------ Execution errors ------

    /// A node exhausted its retries with an error.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

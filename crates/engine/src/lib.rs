//! `engine` crate — the flow DSL, its expression tree, and the evaluator.
//!
//! ```text
//! DSL text ──Parser──▶ Expr (cached per Flow) ──Flow::evaluate──▶ bool + trace
//! ```

pub mod error;
pub mod executor;
pub mod expr;
pub mod parser;

pub use error::{EngineError, ParseError};
pub use executor::Flow;
pub use expr::{group, loop_until, on_failure, on_success, parallel, sequence, Expr};
pub use parser::{tokenize, Parser, MAX_NESTING};

#[cfg(test)]
mod executor_tests;

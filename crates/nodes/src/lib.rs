//! `nodes` crate — the unit of work and everything it touches at run time.
//!
//! - [`State`]: per-run key/value store plus bounded execution trace.
//! - [`Node`]: a named [`ExecutableNode`] body with timeout and retry policy.
//! - [`Registry`]: name → node table the DSL parser resolves leaves against.

pub mod error;
pub mod mock;
pub mod node;
pub mod registry;
pub mod state;
pub mod traits;

pub use error::{DefinitionError, ExecutionError, NodeError};
pub use node::{Node, NodeOptions};
pub use registry::Registry;
pub use state::{State, StateConfig, StateGuard, TraceEntry, DEFAULT_MAX_TRACE};
pub use traits::{ExecutableNode, FnNode};

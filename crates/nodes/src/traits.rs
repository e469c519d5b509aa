//! The `ExecutableNode` trait — the contract every node body must fulfil.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{NodeError, State};

/// User-supplied work wrapped by a [`Node`](crate::Node).
///
/// Returning `Ok(false)` is a completed execution, not a failure: the wrapper
/// stops retrying and hands `false` to the evaluator. Only `Err` (and a
/// timeout) consume the retry budget.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    async fn execute(&self, state: &State) -> Result<bool, NodeError>;
}

/// Adapter that lets a closure act as a node body; see [`Node::from_fn`](crate::Node::from_fn).
pub struct FnNode<F>(pub F);

#[async_trait]
impl<F> ExecutableNode for FnNode<F>
where
    F: for<'a> Fn(&'a State) -> BoxFuture<'a, Result<bool, NodeError>> + Send + Sync,
{
    async fn execute(&self, state: &State) -> Result<bool, NodeError> {
        (self.0)(state).await
    }
}

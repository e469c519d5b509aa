//! `Node` — a named unit of work plus its timeout and retry policy.
//!
//! [`Node::execute`] is the execution wrapper. Each attempt runs the body
//! under the node's deadline and resolves to one of three outcomes:
//!
//! | Outcome      | Trace status | Retried? | Final result            |
//! |--------------|--------------|----------|-------------------------|
//! | `Completed`  | `OK`         | no       | the body's boolean      |
//! | `TimedOut`   | `TIMEOUT`    | yes      | `Ok(false)`             |
//! | `Failed`     | `ERR(kind)`  | yes      | `Err(ExecutionError)`   |
//!
//! Every attempt appends one `"<name>:<STATUS>:<secs>s"` trace event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::traits::FnNode;
use crate::{ExecutableNode, ExecutionError, NodeError, State};

// ---------------------------------------------------------------------------
// NodeOptions
// ---------------------------------------------------------------------------

/// Serializable policy for a node, e.g. loaded alongside a flow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOptions {
    /// Per-attempt deadline in seconds; `None` means no deadline.
    pub timeout_secs: Option<f64>,
    /// Extra attempts after the first.
    pub retries: u32,
    /// Base back-off between attempts, doubled after each retry.
    pub retry_delay_ms: u64,
}

// ---------------------------------------------------------------------------
// Attempt outcome
// ---------------------------------------------------------------------------

/// Result of a single attempt, kept internal to the retry loop.
#[derive(Debug)]
enum Attempt {
    Completed(bool),
    TimedOut,
    Failed(NodeError),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Immutable after construction; shared as `Arc<Node>` by the registry and
/// every expression tree that references it.
pub struct Node {
    name: String,
    timeout: Option<Duration>,
    retries: u32,
    retry_delay: Duration,
    body: Arc<dyn ExecutableNode>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// A node with no timeout and no retries.
    pub fn new(name: impl Into<String>, body: impl ExecutableNode + 'static) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            retries: 0,
            retry_delay: Duration::ZERO,
            body: Arc::new(body),
        }
    }

    /// A node whose body is a closure returning a boxed future:
    ///
    /// ```
    /// use nodes::Node;
    /// use futures::FutureExt;
    ///
    /// let fetch = Node::from_fn("fetch", |state| {
    ///     async move {
    ///         state.set("data", serde_json::json!({ "value": 42 })).await?;
    ///         Ok::<_, nodes::NodeError>(true)
    ///     }
    ///     .boxed()
    /// });
    /// assert_eq!(fetch.name(), "fetch");
    /// ```
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a State) -> BoxFuture<'a, Result<bool, NodeError>> + Send + Sync + 'static,
    {
        Self::new(name, FnNode(f))
    }

    /// Per-attempt deadline. A zero duration is rejected at registration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Extra attempts after the first, so `retries + 1` attempts in total.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Back-off before the first retry; doubled for each further retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_options(mut self, options: &NodeOptions) -> Self {
        self.timeout = options
            .timeout_secs
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO));
        self.retries = options.retries;
        self.retry_delay = Duration::from_millis(options.retry_delay_ms);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Run the body with the node's retry and timeout policy.
    ///
    /// # Errors
    /// Returns [`ExecutionError`] when every attempt failed and the last one
    /// failed with an error. A last attempt that timed out yields `Ok(false)`.
    pub async fn execute(&self, state: &State) -> Result<bool, ExecutionError> {
        let attempts = self.retries.saturating_add(1);
        let mut attempt = 1u32;

        loop {
            let started = Instant::now();
            let outcome = self.attempt(state).await;
            let secs = started.elapsed().as_secs_f64();
            let last = attempt >= attempts;

            match outcome {
                Attempt::Completed(result) => {
                    state.log(format!("{}:OK:{secs:.3}s", self.name), None);
                    return Ok(result);
                }

                Attempt::TimedOut => {
                    state.log(format!("{}:TIMEOUT:{secs:.3}s", self.name), None);
                    if last {
                        warn!(
                            "node '{}' timed out on its last attempt ({}/{}), resolving to false",
                            self.name, attempt, attempts
                        );
                        return Ok(false);
                    }
                    warn!(
                        "node '{}' timed out (attempt {}/{}), retrying",
                        self.name, attempt, attempts
                    );
                }

                Attempt::Failed(err) => {
                    state.log(format!("{}:ERR({}):{secs:.3}s", self.name, err.kind()), None);
                    if last {
                        error!(
                            "node '{}' failed after {} attempt(s): {}",
                            self.name, attempts, err
                        );
                        return Err(ExecutionError {
                            node: self.name.clone(),
                            attempts,
                            source: err,
                        });
                    }
                    warn!(
                        "node '{}' failed (attempt {}/{}), retrying: {}",
                        self.name, attempt, attempts, err
                    );
                }
            }

            let delay = self
                .retry_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    /// One attempt. Dropping the body's future on timeout cancels it.
    async fn attempt(&self, state: &State) -> Attempt {
        let run = self.body.execute(state);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_elapsed) => return Attempt::TimedOut,
            },
            None => run.await,
        };

        match result {
            Ok(value) => Attempt::Completed(value),
            Err(err) => Attempt::Failed(err),
        }
    }
}

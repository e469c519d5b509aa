//! Flow execution engine.
//!
//! `Flow` is the central orchestrator:
//! 1. Compiles DSL text into an [`Expr`] via the [`Parser`], caching the tree
//!    by the exact input string.
//! 2. Walks the tree recursively, dispatching each leaf through
//!    [`Node::execute`](nodes::Node::execute) (timeout + retry wrapper).
//! 3. Combines branch results per operator; see [`Flow::evaluate`].
//!
//! Concurrency is cooperative: `&` polls its branches on the caller's task
//! with `join_all`, so a single `&State` is shared without `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use nodes::{ExecutionError, Registry, State};

use crate::expr::Expr;
use crate::parser::Parser;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Compiles and runs flow expressions against one registry.
///
/// The compiled-expression cache lives as long as the `Flow` and is never
/// evicted; DSL strings are expected to be a small fixed set per program.
pub struct Flow {
    registry: Arc<Registry>,
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl Flow {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Parse `text`, or return the tree cached for the identical string.
    ///
    /// Failed parses are not cached.
    pub fn compile(&self, text: &str) -> Result<Arc<Expr>, EngineError> {
        if let Some(expr) = self.cache.lock().get(text) {
            debug!("expression cache hit for {:?}", text);
            return Ok(Arc::clone(expr));
        }

        debug!("expression cache miss for {:?}, parsing", text);
        let expr = Arc::new(Parser::new(&self.registry).parse(text)?);

        let mut cache = self.cache.lock();
        // A concurrent compile of the same text may have won the race; keep
        // the first tree so every caller shares one.
        let expr = cache.entry(text.to_owned()).or_insert(expr);
        Ok(Arc::clone(expr))
    }

    /// Number of distinct expressions compiled so far.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Compile `text` and evaluate it against `state`.
    ///
    /// # Errors
    /// - [`EngineError::Parse`] / [`EngineError::UnknownNode`] before any node
    ///   runs.
    /// - [`EngineError::Execution`] if a node exhausts its retries with an
    ///   error; the trace still records every attempt made.
    #[instrument(skip(self, state), fields(trace_id = %state.trace_id()))]
    pub async fn run(&self, text: &str, state: &State) -> Result<bool, EngineError> {
        let expr = self.compile(text)?;
        info!("running flow");
        let result = Self::evaluate(&expr, state).await?;
        info!("flow finished with result {}", result);
        Ok(result)
    }

    /// Evaluate a tree built in code, bypassing the parser and cache.
    #[instrument(skip(self, expr, state), fields(trace_id = %state.trace_id(), expr = %expr))]
    pub async fn run_expr(&self, expr: &Expr, state: &State) -> Result<bool, EngineError> {
        let result = Self::evaluate(expr, state).await?;
        info!("flow finished with result {}", result);
        Ok(result)
    }

    /// Recursively evaluate `expr`:
    ///
    /// | Variant          | Behaviour                                                   |
    /// |------------------|-------------------------------------------------------------|
    /// | `Leaf`           | node's wrapped execution result                             |
    /// | `Seq(a, b)`      | run `a`, then always `b`; result of `b`                     |
    /// | `Par(a, b)`      | run both to completion concurrently; `a && b`               |
    /// | `CondSuccess`    | run `b` only if `a` is true, else `false`                   |
    /// | `CondFail`       | run `b` only if `a` is false, else `true`                   |
    /// | `Loop(a, b, n)`  | up to `n` rounds of `a` then `b`; stop as soon as `b` holds |
    /// | `Group(e)`       | result of `e`                                               |
    ///
    /// Left-nested chains of `>>`, `?` and `|` are walked in a loop, and a
    /// chain of `&` is joined as one fan-out, so stack use does not grow
    /// with the number of stages.
    ///
    /// An [`ExecutionError`] aborts the branch it occurs in. Under `Par` every
    /// sibling still runs to completion before the error is returned; if
    /// several branches fail, the leftmost error wins.
    pub fn evaluate<'a>(expr: &'a Expr, state: &'a State) -> BoxFuture<'a, Result<bool, ExecutionError>> {
        async move {
            match expr {
                Expr::Leaf(node) => node.execute(state).await,

                Expr::Seq(..) | Expr::CondSuccess(..) | Expr::CondFail(..) => {
                    Self::evaluate_chain(expr, state).await
                }

                Expr::Par(..) => Self::evaluate_parallel(expr, state).await,

                Expr::Loop(body, until, max_iterations) => {
                    let max_iterations = max_iterations.get();
                    let mut done = false;
                    for iteration in 1..=max_iterations {
                        Self::evaluate(body, state).await?;
                        done = Self::evaluate(until, state).await?;
                        if done {
                            debug!("loop: condition met on iteration {}/{}", iteration, max_iterations);
                            break;
                        }
                        debug!("loop: iteration {}/{} unmet", iteration, max_iterations);
                    }
                    Ok(done)
                }

                Expr::Group(inner) => Self::evaluate(inner, state).await,
            }
        }
        .boxed()
    }

    async fn evaluate_chain(expr: &Expr, state: &State) -> Result<bool, ExecutionError> {
        let (head, stages) = unwind_chain(expr);
        let mut result = Self::evaluate(head, state).await?;

        for stage in stages {
            result = match stage {
                Stage::Then(next) => {
                    debug!("sequence: left finished with {}, running right", result);
                    Self::evaluate(next, state).await?
                }
                Stage::OnSuccess(then) if result => Self::evaluate(then, state).await?,
                Stage::OnSuccess(then) => {
                    debug!("on-success: condition false, skipping {}", then);
                    false
                }
                Stage::OnFailure(fallback) if result => {
                    debug!("on-failure: condition true, skipping {}", fallback);
                    true
                }
                Stage::OnFailure(fallback) => Self::evaluate(fallback, state).await?,
            };
        }

        Ok(result)
    }

    async fn evaluate_parallel(expr: &Expr, state: &State) -> Result<bool, ExecutionError> {
        let branches = parallel_branches(expr);
        debug!("parallel: joining {} branches", branches.len());

        let results = join_all(branches.into_iter().map(|branch| Self::evaluate(branch, state))).await;

        let mut all = true;
        for result in results {
            all &= result?;
        }
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Tree walking helpers
// ---------------------------------------------------------------------------

/// One step after the head of a `>>`/`?`/`|` chain.
enum Stage<'a> {
    Then(&'a Expr),
    OnSuccess(&'a Expr),
    OnFailure(&'a Expr),
}

/// Split a left-nested chain into its head and the stages that follow it,
/// in execution order. Groups on the left spine are transparent.
fn unwind_chain(mut expr: &Expr) -> (&Expr, Vec<Stage<'_>>) {
    let mut stages = Vec::new();
    loop {
        match expr {
            Expr::Seq(left, right) => {
                stages.push(Stage::Then(right));
                expr = &**left;
            }
            Expr::CondSuccess(left, right) => {
                stages.push(Stage::OnSuccess(right));
                expr = &**left;
            }
            Expr::CondFail(left, right) => {
                stages.push(Stage::OnFailure(right));
                expr = &**left;
            }
            Expr::Group(inner) => expr = &**inner,
            _ => break,
        }
    }
    stages.reverse();
    (expr, stages)
}

/// Every operand of a (possibly nested) `&` composition, left to right.
fn parallel_branches(expr: &Expr) -> Vec<&Expr> {
    let mut branches = Vec::new();
    let mut pending = vec![expr];
    while let Some(expr) = pending.pop() {
        match expr {
            Expr::Par(left, right) => {
                pending.push(&**right);
                pending.push(&**left);
            }
            Expr::Group(inner) if matches!(**inner, Expr::Par(..)) => pending.push(&**inner),
            other => branches.push(other),
        }
    }
    branches
}

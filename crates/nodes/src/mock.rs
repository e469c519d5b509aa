//! `MockNode` — a scripted test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where the node's own logic is
//! irrelevant and only its outcome, timing, and call order matter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ExecutableNode, Node, NodeError, State};

/// What a `MockNode` does on a given call.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return the boolean immediately.
    Return(bool),
    /// Fail with `NodeError::Failed { kind, message }`.
    Fail(String, String),
    /// Sleep, then return the boolean.
    Sleep { duration: Duration, result: bool },
}

/// Shared, ordered record of every mock call; clones observe the same log.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node names in call order.
    pub fn order(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mock node that records every call and follows a script.
///
/// Call `n` uses `script[n]`; once the script runs out the last step repeats.
pub struct MockNode {
    /// Label recorded in the call log and used as the node name.
    pub name: String,
    pub script: Vec<MockBehaviour>,
    /// Optional `(key, value)` written to the state on every call.
    pub writes: Option<(String, Value)>,
    calls: CallLog,
}

impl MockNode {
    pub fn scripted(name: impl Into<String>, script: Vec<MockBehaviour>) -> Self {
        Self {
            name: name.into(),
            script,
            writes: None,
            calls: CallLog::new(),
        }
    }

    /// Create a mock that always returns `result`.
    pub fn returning(name: impl Into<String>, result: bool) -> Self {
        Self::scripted(name, vec![MockBehaviour::Return(result)])
    }

    /// Create a mock that always fails.
    pub fn failing(name: impl Into<String>, kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::scripted(name, vec![MockBehaviour::Fail(kind.into(), msg.into())])
    }

    /// Create a mock that sleeps for `duration` then returns `result`.
    pub fn sleeping(name: impl Into<String>, duration: Duration, result: bool) -> Self {
        Self::scripted(name, vec![MockBehaviour::Sleep { duration, result }])
    }

    /// Record calls into `log` instead of a private one.
    pub fn recording_into(mut self, log: &CallLog) -> Self {
        self.calls = log.clone();
        self
    }

    /// Write `value` under `key` on every call.
    pub fn writing(mut self, key: impl Into<String>, value: Value) -> Self {
        self.writes = Some((key.into(), value));
        self
    }

    /// Handle on this mock's call log; stays valid after `into_node`.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn into_node(self) -> Node {
        let name = self.name.clone();
        Node::new(name, self)
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(&self, state: &State) -> Result<bool, NodeError> {
        let call = {
            let mut calls = self.calls.0.lock();
            let call = calls.iter().filter(|n| **n == self.name).count();
            calls.push(self.name.clone());
            call
        };

        if let Some((key, value)) = &self.writes {
            state.set(key.clone(), value).await?;
        }

        let step = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(MockBehaviour::Return(true));

        match step {
            MockBehaviour::Return(result) => Ok(result),
            MockBehaviour::Fail(kind, msg) => Err(NodeError::failed(kind, msg)),
            MockBehaviour::Sleep { duration, result } => {
                tokio::time::sleep(duration).await;
                Ok(result)
            }
        }
    }
}

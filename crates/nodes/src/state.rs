//! `State` — the per-run key/value store and its bounded execution trace.
//!
//! A single `State` is shared by reference with every node a run executes,
//! including both branches of a parallel composition. Two locks exist:
//!
//! - the key/value map and the trace each sit behind a short-lived
//!   `parking_lot` lock that is never held across an `.await`;
//! - an async *guard* that, in thread-safe mode, every `get`/`set` acquires
//!   for that single operation, and that callers can hold explicitly via
//!   [`State::exclusive`] for multi-key transactions.
//!
//! Appending to the trace never waits on the guard.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Default capacity of the execution trace.
pub const DEFAULT_MAX_TRACE: usize = 1000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Construction options for a [`State`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Trace capacity; the oldest entry is evicted beyond it.
    pub max_trace: usize,
    /// Acquire the guard around every `get`/`set`.
    pub thread_safe: bool,
    /// Fixed trace id; a UUID v4 is generated when absent.
    pub trace_id: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_trace: DEFAULT_MAX_TRACE,
            thread_safe: false,
            trace_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TraceEntry
// ---------------------------------------------------------------------------

/// One line of the execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub event: String,
    pub metadata: Option<Value>,
}

fn now_epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct State {
    data: RwLock<HashMap<String, Value>>,
    guard: AsyncMutex<()>,
    thread_safe: bool,
    trace: Mutex<VecDeque<TraceEntry>>,
    max_trace: usize,
    trace_id: String,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// An empty state with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    pub fn with_config(config: StateConfig) -> Self {
        Self::with_data(HashMap::new(), config)
    }

    /// A state pre-populated with `data`.
    ///
    /// A `max_trace` of zero is raised to one so the trace can always hold
    /// the most recent event.
    pub fn with_data(data: HashMap<String, Value>, config: StateConfig) -> Self {
        let max_trace = config.max_trace.max(1);
        Self {
            data: RwLock::new(data),
            guard: AsyncMutex::new(()),
            thread_safe: config.thread_safe,
            trace: Mutex::new(VecDeque::with_capacity(max_trace.min(DEFAULT_MAX_TRACE))),
            max_trace,
            trace_id: config
                .trace_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn max_trace(&self) -> usize {
        self.max_trace
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    // -----------------------------------------------------------------------
    // Key/value access
    // -----------------------------------------------------------------------

    /// The stored value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.single_op_guard().await;
        self.read_value(key)
    }

    /// The stored value for `key`, or `default` when absent.
    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    /// The stored value for `key` deserialized into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(key).await.map(serde_json::from_value).transpose()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        let _guard = self.single_op_guard().await;
        self.write_value(key.into(), value);
        Ok(())
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let _guard = self.single_op_guard().await;
        self.data
            .read()
            .contains_key(key)
    }

    /// Hold the guard for a sequence of reads and writes.
    ///
    /// Other `get`/`set` calls in thread-safe mode, and other `exclusive`
    /// callers in any mode, wait until the returned guard is dropped. Do not
    /// call `State::get`/`State::set` while holding it in thread-safe mode;
    /// use the guard's own accessors instead.
    pub async fn exclusive(&self) -> StateGuard<'_> {
        StateGuard {
            _permit: self.guard.lock().await,
            state: self,
        }
    }

    async fn single_op_guard(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        if self.thread_safe {
            Some(self.guard.lock().await)
        } else {
            None
        }
    }

    fn read_value(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .get(key)
            .cloned()
    }

    fn write_value(&self, key: String, value: Value) {
        self.data
            .write()
            .insert(key, value);
    }

    // -----------------------------------------------------------------------
    // Trace
    // -----------------------------------------------------------------------

    /// Append `(now, event, metadata)` to the trace, evicting the oldest
    /// entry when the trace is full.
    pub fn log(&self, event: impl Into<String>, metadata: Option<Value>) {
        let entry = TraceEntry {
            timestamp: now_epoch_seconds(),
            event: event.into(),
            metadata,
        };
        let mut trace = self.trace.lock();
        while trace.len() >= self.max_trace {
            trace.pop_front();
        }
        trace.push_back(entry);
    }

    /// Oldest-first snapshot of the trace.
    pub fn trace(&self) -> Vec<TraceEntry> {
        self.trace
            .lock()
            .iter()
            .cloned()
            .collect()
    }

    /// Oldest-first event strings.
    pub fn events(&self) -> Vec<String> {
        self.trace
            .lock()
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn trace_len(&self) -> usize {
        self.trace.lock().len()
    }

    /// Take the whole trace, leaving it empty. Used by exporters.
    pub fn drain_trace(&self) -> Vec<TraceEntry> {
        self.trace
            .lock()
            .drain(..)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// StateGuard
// ---------------------------------------------------------------------------

/// Exclusive access to a [`State`]'s key/value map; see [`State::exclusive`].
pub struct StateGuard<'a> {
    _permit: AsyncMutexGuard<'a, ()>,
    state: &'a State,
}

impl StateGuard<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read_value(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.state.write_value(key.into(), value);
        Ok(())
    }

    /// Logging stays available while the guard is held.
    pub fn log(&self, event: impl Into<String>, metadata: Option<Value>) {
        self.state.log(event, metadata);
    }
}

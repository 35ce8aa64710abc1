//! Recorder shared by the proxies of one run

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use super::record::{CallHistory, CallKind, CallOutcome, CallRecord};

/// When an invocation started
#[derive(Debug, Clone, Copy)]
pub struct CallStart {
    at: DateTime<Utc>,
    instant: Instant,
}

impl CallStart {
    pub fn now() -> Self {
        Self {
            at: Utc::now(),
            instant: Instant::now(),
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.instant.elapsed()
    }
}

/// Append-only call recorder
///
/// Clones share the same log. The lock is held only to assign the sequence
/// number and push; records are built before it is taken.
#[derive(Debug, Clone)]
pub struct Recorder {
    run_id: Arc<str>,
    records: Arc<Mutex<Vec<CallRecord>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    /// Create a recorder for a new run
    pub fn new() -> Self {
        Self::with_run_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Arc::from(run_id.into()),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append a completed invocation and return its sequence number
    ///
    /// Concurrent callers are ordered by who reaches the append first.
    pub fn record(
        &self,
        kind: CallKind,
        server_name: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
        outcome: CallOutcome,
        start: CallStart,
    ) -> u64 {
        let mut record = CallRecord {
            sequence: 0,
            kind,
            server_name: server_name.into(),
            name: name.into(),
            arguments,
            outcome,
            started_at: start.at(),
            duration: start.elapsed(),
        };

        let sequence = {
            let mut records = self.lock();
            let sequence = records.len() as u64;
            record.sequence = sequence;
            records.push(record);
            sequence
        };

        debug!(run_id = %self.run_id, sequence, %kind, "Recorded call");
        sequence
    }

    /// Copy of the history so far
    pub fn snapshot(&self) -> CallHistory {
        let records = self.lock().clone();
        CallHistory::new(self.run_id.to_string(), records)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CallRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Call records and persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

use super::HISTORY_SCHEMA_VERSION;
use crate::error::{McpCheckError, Result};
use crate::mcp::JsonRpcError;

/// What kind of capability was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Tool,
    Resource,
    Prompt,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Tool => write!(f, "tool"),
            CallKind::Resource => write!(f, "resource"),
            CallKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// The downstream's answer: a result or an error, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Result(Value),
    Error(JsonRpcError),
}

impl CallOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, CallOutcome::Error(_))
    }
}

impl From<std::result::Result<Value, JsonRpcError>> for CallOutcome {
    fn from(outcome: std::result::Result<Value, JsonRpcError>) -> Self {
        match outcome {
            Ok(value) => CallOutcome::Result(value),
            Err(error) => CallOutcome::Error(error),
        }
    }
}

/// One intercepted invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Position in the history, assigned at append time
    pub sequence: u64,

    pub kind: CallKind,

    /// Downstream server that handled the call
    pub server_name: String,

    /// Tool name, resource URI or prompt name
    pub name: String,

    /// Arguments as the caller sent them
    #[serde(default)]
    pub arguments: Value,

    #[serde(flatten)]
    pub outcome: CallOutcome,

    pub started_at: DateTime<Utc>,

    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// Ordered, read-only view of the calls made during one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallHistory {
    /// Identifier of the run that produced this history
    pub run_id: String,

    records: Vec<CallRecord>,
}

impl CallHistory {
    pub(crate) fn new(run_id: impl Into<String>, records: Vec<CallRecord>) -> Self {
        Self {
            run_id: run_id.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CallRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.iter()
    }

    /// Records of one kind, in sequence order
    pub fn of_kind(&self, kind: CallKind) -> impl Iterator<Item = &CallRecord> {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    /// All tool invocations
    pub fn tool_calls(&self) -> impl Iterator<Item = &CallRecord> {
        self.of_kind(CallKind::Tool)
    }

    /// Save the history as JSON lines: a header, then one record per line
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);

        let header = serde_json::json!({
            "type": "header",
            "schema_version": HISTORY_SCHEMA_VERSION,
            "run_id": self.run_id,
            "records": self.records.len(),
        });
        writeln!(writer, "{}", serde_json::to_string(&header)?)?;

        for record in &self.records {
            writeln!(writer, "{}", serde_json::to_string(record)?)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Load a history saved with [`CallHistory::save`]
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable, a line is not a record, or the
    /// sequence numbers are not dense and increasing from 0.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        let header_line = lines
            .next()
            .ok_or_else(|| McpCheckError::History("Empty history file".to_string()))??;
        let header: Value = serde_json::from_str(&header_line)?;
        if header["type"].as_str() != Some("header") {
            return Err(McpCheckError::History("Missing history header".to_string()));
        }

        let version = header["schema_version"].as_u64().unwrap_or(0);
        if version > u64::from(HISTORY_SCHEMA_VERSION) {
            return Err(McpCheckError::History(format!(
                "Unsupported history schema version {}",
                version
            )));
        }

        let run_id = header["run_id"].as_str().unwrap_or("unknown").to_string();

        let mut records = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CallRecord = serde_json::from_str(&line)?;
            if record.sequence != records.len() as u64 {
                return Err(McpCheckError::History(format!(
                    "Expected sequence {}, found {}",
                    records.len(),
                    record.sequence
                )));
            }
            records.push(record);
        }

        Ok(Self::new(run_id, records))
    }
}

impl<'a> IntoIterator for &'a CallHistory {
    type Item = &'a CallRecord;
    type IntoIter = std::slice::Iter<'a, CallRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(sequence: u64, kind: CallKind, name: &str) -> CallRecord {
        CallRecord {
            sequence,
            kind,
            server_name: "fs".to_string(),
            name: name.to_string(),
            arguments: json!({"path": "/tmp"}),
            outcome: CallOutcome::Result(json!({"ok": true})),
            started_at: Utc::now(),
            duration: Duration::from_millis(12),
        }
    }

    #[test]
    fn test_outcome_serializes_as_result_or_error() {
        let ok = serde_json::to_value(record(0, CallKind::Tool, "read")).unwrap();
        assert_eq!(ok["result"], json!({"ok": true}));
        assert!(ok.get("error").is_none());
        assert_eq!(ok["kind"], "tool");
        assert_eq!(ok["duration"], "12ms");

        let mut failed = record(1, CallKind::Tool, "read");
        failed.outcome = CallOutcome::Error(JsonRpcError::new(-32002, "not found"));
        let failed = serde_json::to_value(failed).unwrap();
        assert_eq!(failed["error"]["code"], -32002);
        assert!(failed.get("result").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let history = CallHistory::new(
            "run-1",
            vec![
                record(0, CallKind::Tool, "read"),
                record(1, CallKind::Resource, "file:///tmp/a"),
            ],
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        history.save(&path).unwrap();

        let loaded = CallHistory::load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.records()[1].kind, CallKind::Resource);
        assert_eq!(loaded.tool_calls().count(), 1);
    }

    #[test]
    fn test_load_rejects_sequence_gap() {
        let history = CallHistory::new(
            "run-2",
            vec![record(0, CallKind::Tool, "a"), record(2, CallKind::Tool, "b")],
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap.jsonl");
        history.save(&path).unwrap();

        let err = CallHistory::load(&path).unwrap_err();
        assert!(matches!(err, McpCheckError::History(_)));
    }

    #[test]
    fn test_load_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        assert!(CallHistory::load(&path).is_err());
    }
}

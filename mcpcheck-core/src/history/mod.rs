//! Call history for a proxied task run
//!
//! Every invocation the proxy forwards ends up here as one [`CallRecord`].
//! The log is append-only: a record's sequence number is assigned when it is
//! appended, and sequence numbers are dense from 0.
//!
//! # Example
//!
//! ```rust
//! use mcpcheck_core::history::{CallKind, CallOutcome, CallStart, Recorder};
//! use serde_json::json;
//!
//! let recorder = Recorder::new();
//! let start = CallStart::now();
//! recorder.record(
//!     CallKind::Tool,
//!     "kubernetes",
//!     "pods_list",
//!     json!({"namespace": "default"}),
//!     CallOutcome::Result(json!({"content": []})),
//!     start,
//! );
//!
//! let history = recorder.snapshot();
//! assert_eq!(history.len(), 1);
//! ```

mod record;
mod recorder;

pub use record::{CallHistory, CallKind, CallOutcome, CallRecord};
pub use recorder::{CallStart, Recorder};

/// Current schema version for persisted histories
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

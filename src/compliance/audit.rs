//! Append-only audit trail for outbound texts.
//!
//! Entries keep a bounded preview rather than the full text so the trail
//! grows with message count, not message size. Sinks never fail the caller;
//! write errors are logged.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// What happened to the audited text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Finalized and eligible for sending
    Approved,
    /// Stopped by a hard-block rule
    Blocked,
}

/// One write-once audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Length of the audited text, in characters
    pub text_length: usize,
    /// Leading characters of the audited text
    pub text_preview: String,
    pub outcome: AuditOutcome,
    /// Block reason, for blocked texts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditLogEntry {
    /// Build an entry, keeping at most `preview_chars` characters of `text`.
    pub fn new(
        timestamp: DateTime<Utc>,
        text: &str,
        preview_chars: usize,
        outcome: AuditOutcome,
        reason: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            text_length: text.chars().count(),
            text_preview: text.chars().take(preview_chars).collect(),
            outcome,
            reason,
        }
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Append one entry. Must not panic or block for long.
    fn append(&self, entry: &AuditLogEntry);
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry appended so far.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditLogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// Emits entries as structured log events on the `outbound_gate::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: &AuditLogEntry) {
        info!(
            target: "outbound_gate::audit",
            timestamp = %entry.timestamp.to_rfc3339(),
            text_length = entry.text_length,
            text_preview = %entry.text_preview,
            outcome = ?entry.outcome,
            reason = entry.reason.as_deref().unwrap_or(""),
            "Outbound text audited"
        );
    }
}

/// Appends entries to a file, one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn append(&self, entry: &AuditLogEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode audit entry");
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit entry");
        }
    }
}

// Fire-and-forget audit trail of order payloads and broker responses
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub ticker: String,
    pub payload: Value,
    pub response: Option<Value>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        ticker: impl Into<String>,
        payload: Value,
        response: Option<Value>,
    ) -> Self {
        Self {
            action: action.into(),
            ticker: ticker.into(),
            payload,
            response,
            at: Utc::now(),
        }
    }
}

/// Durable sink for audit entries
///
/// `record` must not block and must not fail; sinks log their own errors.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}

/// Keeps entries in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}

/// Appends entries to daily per-ticker text files
///
/// Layout: `{directory}/{YYYY-MM-DD}/{TICKER}_OrderPayloads_{YYYY-MM-DD}.txt`.
/// Writes happen on a blocking task fed by an unbounded channel.
pub struct FileAuditSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
    writer: JoinHandle<()>,
}

impl FileAuditSink {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        let writer = tokio::task::spawn_blocking(move || {
            while let Some(entry) = rx.blocking_recv() {
                if let Err(e) = append_entry(&directory, &entry) {
                    tracing::warn!(
                        ticker = %entry.ticker,
                        action = %entry.action,
                        error = %e,
                        "Failed to write audit entry"
                    );
                }
            }
        });

        Self { tx, writer }
    }

    /// Stop accepting entries and wait until everything queued is written
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            tracing::warn!(error = %e, "Audit writer task failed");
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, entry: AuditEntry) {
        if self.tx.send(entry).is_err() {
            tracing::warn!("Audit writer is gone, dropping entry");
        }
    }
}

/// Path of the file an entry is appended to
pub fn audit_file_path(directory: &Path, ticker: &str, at: DateTime<Utc>) -> PathBuf {
    let date = at.format("%Y-%m-%d").to_string();
    directory
        .join(&date)
        .join(format!("{}_OrderPayloads_{}.txt", ticker, date))
}

fn append_entry(directory: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    let path = audit_file_path(directory, &entry.ticker, entry.at);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{} Order for {}:", entry.action, entry.ticker)?;
    writeln!(file, "{}\n", pretty(&entry.payload))?;

    if let Some(response) = &entry.response {
        writeln!(file, "API Response:")?;
        writeln!(file, "{}\n", pretty(response))?;
    }
    Ok(())
}

fn pretty(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

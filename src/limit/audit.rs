//! Append-only JSONL audit sink for limiter decisions.
//!
//! Field aliases (`reason`=`event`, `ua`=`user_agent`) are emitted on every
//! record for operator-tool compatibility.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Events that survive the "important only" filter.
pub const IMPORTANT_EVENTS: &[&str] = &[
    "429",
    "auto-override-add",
    "auto-override-expire",
    "wait-canceled",
];

pub fn is_important(event: &str) -> bool {
    IMPORTANT_EVENTS.contains(&event)
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: String,
    pub ip: String,
    pub country: String,
    pub asn: String,
    pub method: String,
    pub path: String,
    pub host: String,
    pub user_agent: String,
    pub ua: String,
    pub event: String,
    pub reason: String,
    pub rps: f64,
    pub burst: u32,
    pub request_id: String,
}

pub struct AuditSink {
    file: Option<Mutex<File>>,
    important_only: bool,
}

impl AuditSink {
    /// Open the sink for appending; an unopenable file degrades to a no-op
    /// sink rather than failing startup.
    pub fn open(path: &Path, important_only: bool) -> Self {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open rate-limit audit log");
                None
            }
        };
        Self {
            file,
            important_only,
        }
    }

    pub fn should_log(&self, event: &str) -> bool {
        !self.important_only || is_important(event)
    }

    pub fn record(&self, rec: &AuditRecord) {
        let Some(file) = &self.file else {
            return;
        };
        let Ok(json) = serde_json::to_string(rec) else {
            return;
        };
        let mut file = file.lock().expect("audit sink mutex poisoned");
        if let Err(e) = writeln!(file, "{json}") {
            warn!(error = %e, "audit log write failed");
        }
    }

    pub fn close(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().expect("audit sink mutex poisoned").flush();
        }
    }
}

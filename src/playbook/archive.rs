// =============================================================================
// Playbook Archive — structured JSONL records for offline training
// =============================================================================
//
// Every regime snapshot, detected signal, risk snapshot, and kill-switch
// event is appended to a JSONL file under `<root>/<YYYY-MM-DD>/`, one file
// per UTC hour.  Record schema:
//
//   { "timestamp": epoch_secs, "log_type": "regime"|"signal"|"risk"|"kill_switch",
//     "regime": "GREEN"|"YELLOW"|"RED"|null, "payload": { ... } }
//
// Writes are best-effort: an unwritable archive degrades to a logged warning
// and never interrupts the observation loop.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::epoch_now;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookRecord {
    pub timestamp: f64,
    pub log_type: String,
    pub regime: Option<String>,
    pub payload: serde_json::Value,
}

pub struct PlaybookArchive {
    root: PathBuf,
}

impl PlaybookArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Append one record to the current hour's file.
    pub fn write(&self, log_type: &str, regime: Option<String>, payload: serde_json::Value) {
        let record = PlaybookRecord {
            timestamp: epoch_now(),
            log_type: log_type.to_string(),
            regime,
            payload,
        };
        if let Err(e) = self.append(&record) {
            warn!(log_type, error = %e, "playbook archive write failed");
        }
    }

    fn append(&self, record: &PlaybookRecord) -> Result<()> {
        let now = Utc::now();
        let dir = self.root.join(now.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create archive dir {}", dir.display()))?;

        let path = dir.join(format!("{}.jsonl", now.format("%Y-%m-%d_%H")));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open archive file {}", path.display()))?;

        let line = serde_json::to_string(record).context("failed to serialise record")?;
        writeln!(file, "{line}").context("failed to append record")?;
        Ok(())
    }
}

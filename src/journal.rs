use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::{AttemptOutcome, DeliveryAttempt};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub timestamp: String,
    pub campaign_id: String,
    pub artifact: PathBuf,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub checksum: Option<String>,
    pub error: Option<String>,
}

/// Append-only JSONL history of delivery attempts
///
/// Abandoned artifacts stay on disk; this file is how an operator finds them.
pub struct Journal {
    log_file_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Journal {
            log_file_path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// A journal that records nothing
    pub fn disabled() -> Self {
        Journal {
            log_file_path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn new_campaign() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn record(
        &self,
        campaign_id: &str,
        attempt: &DeliveryAttempt,
        checksum: Option<&str>,
        error: Option<String>,
    ) -> Result<()> {
        self.add_entry(JournalEntry {
            timestamp: attempt.timestamp.to_rfc3339(),
            campaign_id: campaign_id.to_string(),
            artifact: attempt.artifact.clone(),
            attempt: attempt.attempt,
            outcome: attempt.outcome,
            checksum: checksum.map(str::to_string),
            error,
        })
    }

    pub fn add_entry(&self, entry: JournalEntry) -> Result<()> {
        let Some(path) = &self.log_file_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open delivery journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<JournalEntry>> {
        let Some(path) = &self.log_file_path else {
            return Ok(Vec::new());
        };
        read_entries(path)
    }

    /// Artifacts whose latest entry is an abandonment and which are still on disk
    pub fn abandoned(&self) -> Result<Vec<JournalEntry>> {
        let mut latest: HashMap<PathBuf, JournalEntry> = HashMap::new();
        for entry in self.read_log()? {
            latest.insert(entry.artifact.clone(), entry);
        }
        let mut out: Vec<JournalEntry> = latest
            .into_values()
            .filter(|e| e.outcome == AttemptOutcome::PermanentFailure && e.artifact.exists())
            .collect();
        out.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        Ok(out)
    }
}

fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).context("Failed to open delivery journal for reading")?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(&line)?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Build a journal row for `artifact` stamped now
pub fn attempt_now(artifact: &Path, attempt: u32, outcome: AttemptOutcome) -> DeliveryAttempt {
    DeliveryAttempt {
        artifact: artifact.to_path_buf(),
        attempt,
        timestamp: Utc::now(),
        outcome,
    }
}

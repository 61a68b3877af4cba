use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plugin_memory_core::{plan_auto_trim, plan_trim, AuditEntry, TrimRequest, DEFAULT_AUDIT_FLOOR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::line_store;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrimReport {
    pub before: usize,
    pub after: usize,
    pub removed: usize,
}

/// Append-only invocation history with bounded growth.
///
/// Appends never rewrite the file. Once the line count passes twice the
/// floor, the file is rewritten to its newest `floor` lines, so it stays
/// between `floor` and `2 * floor` lines after the first trim.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    floor: usize,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, floor: DEFAULT_AUDIT_FLOOR }
    }

    #[must_use]
    pub fn with_floor(mut self, floor: usize) -> Self {
        self.floor = floor;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn floor(&self) -> usize {
        self.floor
    }

    /// Append one entry, then trim if the log has outgrown twice the floor.
    ///
    /// # Errors
    /// Returns an error when the append or the follow-up trim fails.
    pub fn record(&self, entry: &AuditEntry) -> Result<()> {
        line_store::append(&self.path, entry)
            .with_context(|| format!("failed to record audit entry in {}", self.path.display()))?;
        self.auto_trim()?;
        Ok(())
    }

    fn auto_trim(&self) -> Result<Option<TrimReport>> {
        let count = line_store::count_records(&self.path)?;
        let Some(keep) = plan_auto_trim(count, self.floor) else {
            return Ok(None);
        };

        let records = line_store::read_all::<Value>(&self.path)?;
        let excess = records.len().saturating_sub(keep);
        line_store::write_all(&self.path, &records[excess..])?;

        let report = TrimReport { before: count, after: records.len() - excess, removed: excess };
        info!(path = %self.path.display(), ?report, "auto-trimmed audit log");
        Ok(Some(report))
    }

    /// Every readable entry, oldest first.
    ///
    /// # Errors
    /// Returns an error when the log file cannot be read.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        let records = line_store::read_all::<Value>(&self.path)?;
        let mut entries = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match serde_json::from_value(record) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    path = %self.path.display(),
                    record = index + 1,
                    error = %err,
                    "skipping audit record with unexpected shape"
                ),
            }
        }
        Ok(entries)
    }

    /// The newest `last` entries, oldest first.
    ///
    /// # Errors
    /// Returns an error when the log file cannot be read.
    pub fn show(&self, last: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.entries()?;
        let excess = entries.len().saturating_sub(last);
        entries.drain(..excess);
        Ok(entries)
    }

    /// Manual trim evaluated against the current time.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read or rewritten.
    pub fn trim(&self, request: TrimRequest) -> Result<TrimReport> {
        self.trim_at(request, OffsetDateTime::now_utc())
    }

    /// Manual trim: age filter first (bounded below by the floor unless
    /// `keep` is given), then `keep` as the final cap. Records whose
    /// timestamp cannot be read are never removed for age.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read or rewritten.
    pub fn trim_at(&self, request: TrimRequest, now: OffsetDateTime) -> Result<TrimReport> {
        let records = line_store::read_all::<Value>(&self.path)?;
        let timestamps = records.iter().map(record_timestamp).collect::<Vec<_>>();
        let retained = plan_trim(&timestamps, request, self.floor, now);

        let report = TrimReport {
            before: records.len(),
            after: retained.len(),
            removed: records.len() - retained.len(),
        };
        if report.removed == 0 {
            return Ok(report);
        }

        let kept = retained.iter().map(|index| &records[*index]).collect::<Vec<_>>();
        line_store::write_all(&self.path, &kept)
            .with_context(|| format!("failed to rewrite trimmed log {}", self.path.display()))?;
        info!(path = %self.path.display(), ?report, ?request, "trimmed audit log");
        Ok(report)
    }
}

fn record_timestamp(record: &Value) -> Option<OffsetDateTime> {
    let raw = record.get("timestamp")?.as_str()?;
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

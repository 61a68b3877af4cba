use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Which mutation a backup precedes; part of the backup file name.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupOperation {
    Enable,
    Disable,
}

impl BackupOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// A pre-change copy of a settings file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Backup {
    pub path: PathBuf,
    pub sha256: String,
    /// The name was already taken, so the earlier copy was left in place.
    pub reused: bool,
}

/// `<file name>.bak.<operation>.<YYYY-MM-DD--HH-MM-SS>` beside `source`.
///
/// # Errors
/// Returns an error when `source` has no file name or the timestamp cannot
/// be formatted.
pub fn backup_path(
    source: &Path,
    operation: BackupOperation,
    at: OffsetDateTime,
) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name to back up", source.display()))?;
    let stamp = at
        .format(format_description!("[year]-[month]-[day]--[hour]-[minute]-[second]"))
        .context("failed to format backup timestamp")?;

    let mut backup_name = name.to_os_string();
    backup_name.push(format!(".bak.{}.{stamp}", operation.as_str()));
    Ok(source.with_file_name(backup_name))
}

/// Copy `source` beside itself and verify the copy against `expected`, the
/// bytes the caller read and is about to modify.
///
/// An existing backup with the same name is kept untouched and the returned
/// digest describes its contents.
///
/// # Errors
/// Returns an error when the copy fails or its digest does not match
/// `expected`.
pub fn create_backup(
    source: &Path,
    expected: &[u8],
    operation: BackupOperation,
    at: OffsetDateTime,
) -> Result<Backup> {
    let path = backup_path(source, operation, at)?;
    let sha256 = sha256_hex(expected);

    if path.exists() {
        warn!(backup = %path.display(), "backup already exists; keeping it");
        let existing =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(Backup { sha256: sha256_hex(&existing), path, reused: true });
    }

    fs::copy(source, &path).with_context(|| {
        format!("failed to back up {} to {}", source.display(), path.display())
    })?;
    let copied =
        fs::read(&path).with_context(|| format!("failed to read back {}", path.display()))?;
    let actual = sha256_hex(&copied);
    if actual != sha256 {
        bail!(
            "backup {} does not match {} (expected sha256 {sha256}, found {actual})",
            path.display(),
            source.display()
        );
    }

    debug!(source = %source.display(), backup = %path.display(), "backed up settings file");
    Ok(Backup { path, sha256, reused: false })
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

//! Newline-delimited JSON files.
//!
//! Every call opens and closes its own handle. Full rewrites go through a
//! sibling temporary file that is renamed over the target, so readers only
//! ever observe the old or the new complete content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Read every well-formed record in file order.
///
/// A missing file reads as empty. Blank lines are ignored and lines that do
/// not decode as `T` are skipped with a warning.
///
/// # Errors
/// Returns an error when the file exists but cannot be opened or read.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let Some(reader) = open_reader(path)? else {
        return Ok(Vec::new());
    };
    let mut values = Vec::new();

    for (index, line) in reader.split(b'\n').enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(&line) {
            Ok(value) => values.push(value),
            Err(err) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping malformed record"
            ),
        }
    }

    Ok(values)
}

/// Count non-blank lines without decoding them.
///
/// # Errors
/// Returns an error when the file exists but cannot be read.
pub fn count_records(path: &Path) -> Result<usize> {
    let Some(reader) = open_reader(path)? else {
        return Ok(0);
    };
    let mut records = 0_usize;

    for (index, line) in reader.split(b'\n').enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        if !line.iter().all(u8::is_ascii_whitespace) {
            records += 1;
        }
    }

    Ok(records)
}

/// Replace the whole file with `records`, one compact JSON object per line.
///
/// # Errors
/// Returns an error when a record cannot be serialized or the rewrite fails;
/// the target keeps its previous content in both cases.
pub fn write_all<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let body = encode_lines(records)?;
    write_atomic(path, &body)?;
    debug!(path = %path.display(), records = records.len(), "rewrote line store");
    Ok(())
}

/// Append one record as a single `write` of one line.
///
/// # Errors
/// Returns an error when the record cannot be serialized or the file cannot
/// be opened for appending.
pub fn append<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_vec(record).context("failed to serialize line record")?;
    line.push(b'\n');

    ensure_parent_dir(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {} for append", path.display()))?;
    file.write_all(&line).with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Delete the file. Returns whether it existed.
///
/// # Errors
/// Returns an error when the file exists but cannot be removed.
pub fn remove(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Serialize `records` into the on-disk line format.
///
/// # Errors
/// Returns an error when any record fails to serialize.
pub fn encode_lines<T: Serialize>(records: &[T]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, record).context("failed to serialize line record")?;
        body.push(b'\n');
    }
    Ok(body)
}

/// Atomically replace `path` with `bytes`.
///
/// # Errors
/// Returns an error when staging or the final rename fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    stage(path, bytes)?.commit()
}

/// Fully written temporary sibling of a target file, not yet renamed.
///
/// Dropping it without [`StagedWrite::commit`] removes the temporary file and
/// leaves the target untouched.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename the staged file over the target.
    ///
    /// # Errors
    /// Returns an error when the rename fails; the target is unchanged.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to rename staged file over {}", target.display()))?;
        Ok(())
    }
}

/// Write `bytes` to a temporary file beside `path` and flush it to disk.
///
/// The existing target's permissions are carried over to the staged file.
///
/// # Errors
/// Returns an error when the parent directory or the temporary file cannot be
/// created or written.
pub fn stage(path: &Path, bytes: &[u8]) -> Result<StagedWrite> {
    let parent = ensure_parent_dir(path)?;
    let mut temp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temporary file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temporary file for {}", path.display()))?;

    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions()).with_context(|| {
            format!("failed to copy permissions of {} to staged file", path.display())
        })?;
    }

    Ok(StagedWrite { temp, target: path.to_path_buf() })
}

fn open_reader(path: &Path) -> Result<Option<BufReader<File>>> {
    match File::open(path) {
        Ok(file) => Ok(Some(BufReader::new(file))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to open {}", path.display())),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    Ok(parent)
}

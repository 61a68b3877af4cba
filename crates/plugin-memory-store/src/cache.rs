use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::Result;
use plugin_memory_core::{CacheEntry, PairEntry, SourceEntry};
use time::OffsetDateTime;
use tracing::debug;

use crate::line_store;

/// Keyed table of remembered entities backed by one line-store file.
///
/// Every operation re-reads the file and, when it changes anything, rewrites
/// it atomically. There is no cross-process lock: two concurrent upserts can
/// race and the last rewrite wins.
#[derive(Debug, Clone)]
pub struct EntityCache<E> {
    path: PathBuf,
    entry: PhantomData<E>,
}

pub type PairCache = EntityCache<PairEntry>;
pub type SourceCache = EntityCache<SourceEntry>;

impl<E: CacheEntry> EntityCache<E> {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, entry: PhantomData }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in file order.
    ///
    /// # Errors
    /// Returns an error when the backing file cannot be read.
    pub fn list(&self) -> Result<Vec<E>> {
        line_store::read_all(&self.path)
    }

    /// # Errors
    /// Returns an error when the backing file cannot be read.
    pub fn get(&self, identity: &str) -> Result<Option<E>> {
        Ok(self.list()?.into_iter().find(|entry| entry.identity() == identity))
    }

    /// Record one reference to `key` at the current time.
    ///
    /// # Errors
    /// Returns an error when the backing file cannot be read or rewritten.
    pub fn upsert(&self, key: &E::Key, success: bool) -> Result<E> {
        self.upsert_at(key, success, OffsetDateTime::now_utc())
    }

    /// Record one reference to `key` at `now`: create the entry on first
    /// reference, otherwise update it in place. Duplicate identities left by
    /// an outside edit collapse to their first occurrence.
    ///
    /// # Errors
    /// Returns an error when the backing file cannot be read or rewritten.
    pub fn upsert_at(&self, key: &E::Key, success: bool, now: OffsetDateTime) -> Result<E> {
        let identity = E::key_identity(key);
        let mut entries = self.list()?;
        let mut seen = BTreeSet::new();
        entries.retain(|entry| seen.insert(entry.identity().to_string()));

        let updated = if let Some(index) =
            entries.iter().position(|entry| entry.identity() == identity)
        {
            entries[index].record_use(now, success);
            entries[index].clone()
        } else {
            let entry = E::first_use(key, now, success);
            entries.push(entry.clone());
            entry
        };

        line_store::write_all(&self.path, &entries)?;
        debug!(path = %self.path.display(), identity = %identity, success, "upserted cache entry");
        Ok(updated)
    }

    /// Forget one identity. Returns whether it was present.
    ///
    /// # Errors
    /// Returns an error when the backing file cannot be read or rewritten.
    pub fn remove(&self, identity: &str) -> Result<bool> {
        let mut entries = self.list()?;
        let before = entries.len();
        entries.retain(|entry| entry.identity() != identity);
        if entries.len() == before {
            return Ok(false);
        }

        line_store::write_all(&self.path, &entries)?;
        Ok(true)
    }

    /// Delete the backing file. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be removed.
    pub fn clear(&self) -> Result<bool> {
        line_store::remove(&self.path)
    }
}

//! File-backed persistence for remembered pairs, sources and invocation
//! history.
//!
//! Every file is newline-delimited JSON managed through [`line_store`]. There
//! is no cross-process lock: full rewrites are atomic, but two processes
//! rewriting the same file concurrently resolve as last-writer-wins.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

mod audit;
mod cache;
pub mod line_store;

pub use audit::{AuditLog, TrimReport};
pub use cache::{EntityCache, PairCache, SourceCache};

/// Environment variable that overrides the cache root directory.
pub const CACHE_DIR_ENV: &str = "PLUGIN_MEMORY_CACHE_DIR";

const CACHE_DIR_NAME: &str = "plugin-memory";
const PAIRS_FILE: &str = "pairs.jsonl";
const SOURCES_FILE: &str = "sources.jsonl";
const HISTORY_FILE: &str = "history.jsonl";

/// Where the store keeps its files. Constructed once and passed to each
/// component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from [`CACHE_DIR_ENV`], falling back to the platform
    /// cache directory.
    ///
    /// # Errors
    /// Returns an error when the variable is unset and the platform has no
    /// cache directory.
    pub fn from_env() -> Result<Self> {
        Self::resolve(std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from), dirs::cache_dir())
    }

    fn resolve(configured: Option<PathBuf>, platform: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = configured.filter(|root| !root.as_os_str().is_empty()) {
            return Ok(Self::new(root));
        }
        platform.map(|dir| Self::new(dir.join(CACHE_DIR_NAME))).ok_or_else(|| {
            anyhow!("no cache directory available; set {CACHE_DIR_ENV} to choose one")
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn pairs_path(&self) -> PathBuf {
        self.root.join(PAIRS_FILE)
    }

    #[must_use]
    pub fn sources_path(&self) -> PathBuf {
        self.root.join(SOURCES_FILE)
    }

    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    #[must_use]
    pub fn pair_cache(&self) -> PairCache {
        PairCache::new(self.pairs_path())
    }

    #[must_use]
    pub fn source_cache(&self) -> SourceCache {
        SourceCache::new(self.sources_path())
    }

    #[must_use]
    pub fn audit_log(&self) -> AuditLog {
        AuditLog::new(self.history_path())
    }
}

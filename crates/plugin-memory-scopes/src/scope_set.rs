use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use plugin_memory_core::{MemoryError, ScopeKind};
use serde::Serialize;

const SETTINGS_DIR: &str = ".claude";
const SETTINGS_FILE: &str = "settings.json";
const LOCAL_SETTINGS_FILE: &str = "settings.local.json";

/// One external settings file and the scope it represents.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub path: PathBuf,
}

/// The settings files consulted by the reconciler and coordinator, in scan
/// order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    #[must_use]
    pub fn new(scopes: Vec<Scope>) -> Self {
        Self { scopes }
    }

    /// User settings under `home`, project and local settings under
    /// `project`.
    #[must_use]
    pub fn standard(home: &Path, project: &Path) -> Self {
        let user_dir = home.join(SETTINGS_DIR);
        let project_dir = project.join(SETTINGS_DIR);
        Self::new(vec![
            Scope { kind: ScopeKind::User, path: user_dir.join(SETTINGS_FILE) },
            Scope { kind: ScopeKind::Project, path: project_dir.join(SETTINGS_FILE) },
            Scope { kind: ScopeKind::Local, path: project_dir.join(LOCAL_SETTINGS_FILE) },
        ])
    }

    /// [`ScopeSet::standard`] with each root defaulting to the current user's
    /// home directory and the working directory respectively.
    ///
    /// # Errors
    /// Returns an error when a default is needed and cannot be determined.
    pub fn discover(home: Option<PathBuf>, project: Option<PathBuf>) -> Result<Self> {
        let home = match home {
            Some(home) => home,
            None => dirs::home_dir().ok_or_else(|| anyhow!("no home directory available"))?,
        };
        let project = match project {
            Some(project) => project,
            None => std::env::current_dir().context("failed to read working directory")?,
        };
        Ok(Self::standard(&home, &project))
    }

    #[must_use]
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// The single settings file configured for `kind`.
    ///
    /// # Errors
    /// Returns [`MemoryError::UnknownScope`] when this set has no such scope.
    pub fn resolve(&self, kind: ScopeKind) -> Result<&Scope, MemoryError> {
        self.scopes
            .iter()
            .find(|scope| scope.kind == kind)
            .ok_or_else(|| MemoryError::UnknownScope(kind.to_string()))
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use plugin_memory_core::{AuditAction, AuditContext, AuditEntry, PairKey, ScopeKind, ScopeRecord};
use plugin_memory_store::{line_store, AuditLog, PairCache, SourceCache, StoreLayout};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::backup::{create_backup, Backup, BackupOperation};
use crate::reconciler::ScopeReconciler;
use crate::scope_set::{Scope, ScopeSet};
use crate::settings::SettingsDocument;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Activate,
    Deactivate,
}

impl Mutation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }

    fn audit_action(self) -> AuditAction {
        match self {
            Self::Activate => AuditAction::Add,
            Self::Deactivate => AuditAction::Remove,
        }
    }

    fn backup_operation(self) -> BackupOperation {
        match self {
            Self::Activate => BackupOperation::Enable,
            Self::Deactivate => BackupOperation::Disable,
        }
    }
}

/// Result of one mutation against one settings file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeOutcome {
    pub scope: ScopeKind,
    pub path: PathBuf,
    pub mutation: Mutation,
    /// The file changed, or on a dry run would have changed.
    pub changed: bool,
    pub dry_run: bool,
    pub backup: Option<Backup>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeFailure {
    pub scope: ScopeKind,
    pub path: PathBuf,
    pub error: String,
}

/// Per-scope results of a multi-scope operation. Partial success is a
/// normal outcome.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<ScopeOutcome>,
    pub failed: Vec<ScopeFailure>,
}

impl BatchOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write side of the scope state: the only component that edits settings
/// files.
///
/// Each mutation resolves one file, backs it up when it exists and is about
/// to change, rewrites it atomically, then notifies the caches and appends
/// to the audit log. Cache and audit bookkeeping failures are logged and do
/// not change the reported outcome of a mutation that already happened.
#[derive(Debug, Clone)]
pub struct MutationCoordinator {
    scopes: ScopeSet,
    pairs: PairCache,
    sources: SourceCache,
    audit: AuditLog,
}

impl MutationCoordinator {
    #[must_use]
    pub fn new(scopes: ScopeSet, layout: &StoreLayout) -> Self {
        Self {
            scopes,
            pairs: layout.pair_cache(),
            sources: layout.source_cache(),
            audit: layout.audit_log(),
        }
    }

    #[must_use]
    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    #[must_use]
    pub fn reconciler(&self) -> ScopeReconciler {
        ScopeReconciler::new(self.scopes.clone())
    }

    /// Enable `key` in one scope.
    ///
    /// # Errors
    /// Returns an error when the scope is not configured, its file cannot be
    /// read or parsed, the backup fails, or the rewrite fails. A failure
    /// after a successful backup leaves the backup in place.
    pub fn activate(
        &self,
        key: &PairKey,
        scope: ScopeKind,
        context: AuditContext,
    ) -> Result<ScopeOutcome> {
        self.single(key, scope, Mutation::Activate, context)
    }

    /// Remove `key` from one scope's enabled set.
    ///
    /// # Errors
    /// Same conditions as [`MutationCoordinator::activate`]. A missing file
    /// is not an error.
    pub fn deactivate(
        &self,
        key: &PairKey,
        scope: ScopeKind,
        context: AuditContext,
    ) -> Result<ScopeOutcome> {
        self.single(key, scope, Mutation::Deactivate, context)
    }

    /// Deactivate `key` in every configured scope, recording one batch
    /// audit entry for the whole invocation.
    #[must_use]
    pub fn deactivate_everywhere(&self, key: &PairKey, mut context: AuditContext) -> BatchOutcome {
        let mut batch = BatchOutcome::default();
        for scope in self.scopes.scopes() {
            let result = apply(key, scope, Mutation::Deactivate, context.dry_run);
            context.touch(&scope.path);
            match result {
                Ok(outcome) => {
                    let answer = match (outcome.changed, outcome.dry_run) {
                        (false, _) => "unchanged",
                        (true, true) => "would_remove",
                        (true, false) => "removed",
                    };
                    context.answers.insert(scope.kind.to_string(), answer.to_string());
                    batch.succeeded.push(outcome);
                }
                Err(err) => {
                    context.answers.insert(scope.kind.to_string(), "failed".to_string());
                    batch.failed.push(ScopeFailure {
                        scope: scope.kind,
                        path: scope.path.clone(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        let mut entry = AuditEntry::new(AuditAction::Batch, Some(key), context);
        if !batch.is_complete() {
            entry = entry.with_error(format!(
                "{} of {} scopes failed",
                batch.failed.len(),
                self.scopes.scopes().len()
            ));
        }
        self.record(&entry);
        batch
    }

    /// Current state of `key` in every readable scope, recorded as a query.
    #[must_use]
    pub fn query(&self, key: &PairKey, mut context: AuditContext) -> Vec<ScopeRecord> {
        let records = self.reconciler().scan(&key.identity());
        for scope in self.scopes.scopes() {
            context.touch(&scope.path);
        }
        self.record(&AuditEntry::new(AuditAction::Query, Some(key), context));
        records
    }

    fn single(
        &self,
        key: &PairKey,
        kind: ScopeKind,
        mutation: Mutation,
        context: AuditContext,
    ) -> Result<ScopeOutcome> {
        let mut context = context.with_answer("scope", kind.as_str());
        let result = match self.scopes.resolve(kind) {
            Ok(scope) => {
                let result = apply(key, scope, mutation, context.dry_run);
                context.touch(&scope.path);
                result
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to {} {key} in {kind} scope", mutation.as_str()))),
        };

        if mutation == Mutation::Activate {
            self.remember(key, result.is_ok() && !context.dry_run);
        }
        let mut entry = AuditEntry::new(mutation.audit_action(), Some(key), context);
        if let Err(err) = &result {
            entry = entry.with_error(format!("{err:#}"));
        }
        self.record(&entry);
        result
    }

    fn remember(&self, key: &PairKey, success: bool) {
        if let Err(err) = self.pairs.upsert(key, success) {
            warn!(key = %key, error = %format!("{err:#}"), "failed to update pair cache");
        }
        if success {
            if let Err(err) = self.sources.upsert(&key.secondary, true) {
                warn!(
                    source = %key.secondary,
                    error = %format!("{err:#}"),
                    "failed to update source cache"
                );
            }
        }
    }

    fn record(&self, entry: &AuditEntry) {
        if let Err(err) = self.audit.record(entry) {
            warn!(
                action = entry.action.as_str(),
                error = %format!("{err:#}"),
                "failed to record audit entry"
            );
        }
    }
}

fn apply(key: &PairKey, scope: &Scope, mutation: Mutation, dry_run: bool) -> Result<ScopeOutcome> {
    rewrite_scope(key, scope, mutation, dry_run).with_context(|| {
        format!("failed to {} {key} in {} scope", mutation.as_str(), scope.kind)
    })
}

fn rewrite_scope(
    key: &PairKey,
    scope: &Scope,
    mutation: Mutation,
    dry_run: bool,
) -> Result<ScopeOutcome> {
    let identity = key.identity();
    let mut doc = SettingsDocument::load(&scope.path)?;
    let changed = match mutation {
        Mutation::Activate => doc
            .enable(&identity)
            .with_context(|| format!("cannot update {}", scope.path.display()))?,
        Mutation::Deactivate => doc.disable(&identity),
    };

    let mut outcome = ScopeOutcome {
        scope: scope.kind,
        path: scope.path.clone(),
        mutation,
        changed,
        dry_run,
        backup: None,
    };
    if !changed || dry_run {
        debug!(key = %identity, scope = %scope.kind, changed, dry_run, "settings left untouched");
        return Ok(outcome);
    }

    if let Some(original) = doc.original.as_deref() {
        let backup =
            create_backup(&scope.path, original, mutation.backup_operation(), local_now())?;
        outcome.backup = Some(backup);
    }

    let rendered = doc.render()?;
    line_store::write_atomic(&scope.path, &rendered).with_context(|| match &outcome.backup {
        Some(backup) => format!(
            "failed to write {}; pre-change backup kept at {}",
            scope.path.display(),
            backup.path.display()
        ),
        None => format!("failed to write {}", scope.path.display()),
    })?;

    info!(
        key = %identity,
        scope = %scope.kind,
        path = %scope.path.display(),
        mutation = mutation.as_str(),
        "updated settings file"
    );
    Ok(outcome)
}

fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

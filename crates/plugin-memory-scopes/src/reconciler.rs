use std::collections::BTreeMap;

use plugin_memory_core::{ScopeKind, ScopeRecord};
use tracing::warn;

use crate::scope_set::{Scope, ScopeSet};
use crate::settings::SettingsDocument;

/// Read-side projection of the external settings files.
///
/// Every call reads the files afresh. A missing file contributes nothing; a
/// file that cannot be read or parsed is skipped with a warning.
#[derive(Debug, Clone)]
pub struct ScopeReconciler {
    scopes: ScopeSet,
}

impl ScopeReconciler {
    #[must_use]
    pub fn new(scopes: ScopeSet) -> Self {
        Self { scopes }
    }

    #[must_use]
    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// One record per readable, existing settings file, active or not.
    #[must_use]
    pub fn scan(&self, identity: &str) -> Vec<ScopeRecord> {
        self.documents()
            .map(|(scope, doc)| ScopeRecord {
                scope: scope.kind,
                file_path: scope.path.clone(),
                is_active: doc.is_active(identity),
            })
            .collect()
    }

    /// The scopes in which `identity` is currently enabled.
    #[must_use]
    pub fn active_scopes_for(&self, identity: &str) -> Vec<ScopeRecord> {
        let mut records = self.scan(identity);
        records.retain(|record| record.is_active);
        records
    }

    /// Every enabled identity and the scopes enabling it, in scan order.
    #[must_use]
    pub fn all_active_identities(&self) -> BTreeMap<String, Vec<ScopeKind>> {
        let mut active = BTreeMap::<String, Vec<ScopeKind>>::new();
        for (scope, doc) in self.documents() {
            for identity in doc.active_identities() {
                active.entry(identity.to_string()).or_default().push(scope.kind);
            }
        }
        active
    }

    fn documents(&self) -> impl Iterator<Item = (&Scope, SettingsDocument)> + '_ {
        self.scopes.scopes().iter().filter_map(|scope| match SettingsDocument::load(&scope.path) {
            Ok(doc) if doc.exists() => Some((scope, doc)),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    scope = %scope.kind,
                    path = %scope.path.display(),
                    error = %format!("{err:#}"),
                    "skipping unreadable settings file"
                );
                None
            }
        })
    }
}

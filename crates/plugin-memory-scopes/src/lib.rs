//! Reconciliation of remembered pairs against the external settings files
//! that decide where a pair is enabled.
//!
//! [`ScopeReconciler`] is the read side: it answers "where is this active"
//! from the files' current content. [`MutationCoordinator`] is the only
//! writer: it flips one flag in one file per call, with a backup first, and
//! reports each scope's result separately.

mod backup;
mod coordinator;
mod reconciler;
mod scope_set;
mod settings;

pub use backup::{backup_path, create_backup, sha256_hex, Backup, BackupOperation};
pub use coordinator::{BatchOutcome, Mutation, MutationCoordinator, ScopeFailure, ScopeOutcome};
pub use reconciler::ScopeReconciler;
pub use scope_set::{Scope, ScopeSet};
pub use settings::ENABLED_SET_KEY;

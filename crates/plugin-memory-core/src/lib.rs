use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

/// Minimum number of audit entries retained by trimming unless the caller
/// passes an explicit `keep` cap.
pub const DEFAULT_AUDIT_FLOOR: usize = 1000;

pub const KEY_SEPARATOR: char = '@';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MemoryError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("unknown scope: {0}")]
    UnknownScope(String),
}

/// Composite identity `primary@secondary` of a remembered pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PairKey {
    pub primary: String,
    pub secondary: String,
}

impl PairKey {
    /// Build a key from its two halves.
    ///
    /// # Errors
    /// Returns [`MemoryError::InvalidKey`] when either half is blank or the
    /// primary half contains the separator.
    pub fn new(primary: &str, secondary: &str) -> Result<Self, MemoryError> {
        let primary = primary.trim();
        let secondary = secondary.trim();
        if primary.is_empty() || secondary.is_empty() {
            return Err(MemoryError::InvalidKey(format!(
                "both halves of `{primary}{KEY_SEPARATOR}{secondary}` MUST be non-empty"
            )));
        }
        if primary.contains(KEY_SEPARATOR) {
            return Err(MemoryError::InvalidKey(format!(
                "primary `{primary}` MUST NOT contain `{KEY_SEPARATOR}`"
            )));
        }

        Ok(Self { primary: primary.to_string(), secondary: secondary.to_string() })
    }

    /// Parse `primary@secondary`, splitting at the first separator.
    ///
    /// # Errors
    /// Returns [`MemoryError::InvalidKey`] when the separator is missing or
    /// either half is blank.
    pub fn parse(value: &str) -> Result<Self, MemoryError> {
        let Some((primary, secondary)) = value.split_once(KEY_SEPARATOR) else {
            return Err(MemoryError::InvalidKey(format!(
                "`{value}` MUST be formatted as primary{KEY_SEPARATOR}secondary"
            )));
        };
        Self::new(primary, secondary)
    }

    #[must_use]
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl Display for PairKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.primary, self.secondary)
    }
}

impl FromStr for PairKey {
    type Err = MemoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// A record kept in an entity cache file: one per identity, mutated in place
/// on every later reference.
pub trait CacheEntry: Clone + Serialize + DeserializeOwned {
    type Key;

    fn key_identity(key: &Self::Key) -> String;

    fn identity(&self) -> &str;

    fn first_use(key: &Self::Key, now: OffsetDateTime, success: bool) -> Self;

    fn record_use(&mut self, now: OffsetDateTime, success: bool);
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PairEntry {
    pub key: String,
    pub primary: String,
    pub secondary: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
    pub use_count: u64,
    pub attempt_count: u64,
    pub success_count: u64,
}

impl CacheEntry for PairEntry {
    type Key = PairKey;

    fn key_identity(key: &PairKey) -> String {
        key.identity()
    }

    fn identity(&self) -> &str {
        &self.key
    }

    fn first_use(key: &PairKey, now: OffsetDateTime, success: bool) -> Self {
        Self {
            key: key.identity(),
            primary: key.primary.clone(),
            secondary: key.secondary.clone(),
            first_seen: now,
            last_used: now,
            use_count: u64::from(success),
            attempt_count: 1,
            success_count: u64::from(success),
        }
    }

    fn record_use(&mut self, now: OffsetDateTime, success: bool) {
        self.last_used = now;
        self.attempt_count += 1;
        if success {
            self.use_count += 1;
            self.success_count += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceEntry {
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

impl CacheEntry for SourceEntry {
    type Key = String;

    fn key_identity(key: &String) -> String {
        key.trim().to_string()
    }

    fn identity(&self) -> &str {
        &self.source
    }

    fn first_use(key: &String, now: OffsetDateTime, _success: bool) -> Self {
        Self { source: Self::key_identity(key), first_seen: now, last_used: now }
    }

    fn record_use(&mut self, now: OffsetDateTime, _success: bool) {
        self.last_used = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Add,
    Remove,
    Query,
    Batch,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Query => "query",
            Self::Batch => "batch",
        }
    }
}

/// A settings path touched by an invocation, as given and as resolved.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TouchedPath {
    pub raw: String,
    pub canonical: String,
}

impl TouchedPath {
    #[must_use]
    pub fn resolve(path: &std::path::Path) -> Self {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self { raw: path.display().to_string(), canonical: canonical.display().to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditContext {
    #[serde(default)]
    pub command_line: Vec<String>,
    #[serde(default)]
    pub paths: Vec<TouchedPath>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
}

impl AuditContext {
    #[must_use]
    pub fn new(command_line: Vec<String>, dry_run: bool) -> Self {
        Self { command_line, dry_run, ..Self::default() }
    }

    #[must_use]
    pub fn with_answer(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.answers.insert(question.into(), answer.into());
        self
    }

    pub fn touch(&mut self, path: &std::path::Path) {
        let touched = TouchedPath::resolve(path);
        if !self.paths.contains(&touched) {
            self.paths.push(touched);
        }
    }
}

/// One invocation of the tool. Appended once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub key: Option<String>,
    pub action: AuditAction,
    pub context: AuditContext,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(action: AuditAction, key: Option<&PairKey>, context: AuditContext) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            key: key.map(PairKey::identity),
            action,
            context,
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    User,
    Project,
    Local,
}

impl ScopeKind {
    pub const ALL: [Self; 3] = [Self::User, Self::Project, Self::Local];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Project => "project",
            Self::Local => "local",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "project" => Some(Self::Project),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

impl Display for ScopeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = MemoryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| MemoryError::UnknownScope(value.to_string()))
    }
}

/// Derived view of one settings file for one key. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopeRecord {
    pub scope: ScopeKind,
    pub file_path: PathBuf,
    pub is_active: bool,
}

/// JSON truthiness used when reading enabled-set flags.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TrimRequest {
    pub keep: Option<usize>,
    pub older_than_days: Option<u32>,
}

/// Select which audit entries survive a manual trim.
///
/// `timestamps` is in file order (oldest first); `None` marks an entry whose
/// timestamp could not be read, which is never removed for age. Returns the
/// retained indices in ascending order.
///
/// - age filter only: entries older than the cutoff are dropped, but the
///   newest `floor` entries are always kept.
/// - `keep`: applied last as the hard cap, overriding the floor.
/// - neither: keep the newest `floor` entries.
#[must_use]
pub fn plan_trim(
    timestamps: &[Option<OffsetDateTime>],
    request: TrimRequest,
    floor: usize,
    now: OffsetDateTime,
) -> Vec<usize> {
    let total = timestamps.len();
    let newest = |count: usize| (total.saturating_sub(count)..total).collect::<Vec<_>>();

    let mut retained = match request.older_than_days {
        Some(days) => {
            // A cutoff before the representable range means nothing is old enough.
            let cutoff = now.checked_sub(Duration::days(i64::from(days)));
            let fresh = timestamps
                .iter()
                .enumerate()
                .filter(|(_, stamp)| match (stamp, cutoff) {
                    (Some(stamp), Some(cutoff)) => *stamp >= cutoff,
                    _ => true,
                })
                .map(|(index, _)| index)
                .collect::<Vec<_>>();

            if request.keep.is_none() && fresh.len() < floor {
                let mut merged = fresh;
                merged.extend(newest(floor));
                merged.sort_unstable();
                merged.dedup();
                merged
            } else {
                fresh
            }
        }
        None if request.keep.is_some() => (0..total).collect(),
        None => newest(floor),
    };

    if let Some(keep) = request.keep {
        let excess = retained.len().saturating_sub(keep);
        retained.drain(..excess);
    }

    retained
}

/// Number of newest entries to keep after an append, or `None` when the log
/// is still within `2 * floor`.
#[must_use]
pub fn plan_auto_trim(count: usize, floor: usize) -> Option<usize> {
    (count > floor.saturating_mul(2)).then_some(floor)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn days_ago(days: i64) -> Option<OffsetDateTime> {
        Some(fixture_time() - Duration::days(days))
    }

    #[test]
    fn parse_splits_at_first_separator() {
        let key = PairKey::parse("alpha@beta@gamma")
            .unwrap_or_else(|err| panic!("key should parse: {err}"));
        assert_eq!(key.primary, "alpha");
        assert_eq!(key.secondary, "beta@gamma");
        assert_eq!(key.identity(), "alpha@beta@gamma");
    }

    #[test]
    fn parse_rejects_missing_or_blank_halves() {
        for raw in ["alpha", "@beta", "alpha@", " @ "] {
            let Err(err) = PairKey::parse(raw) else {
                panic!("expected `{raw}` to be rejected");
            };
            assert!(matches!(err, MemoryError::InvalidKey(_)), "unexpected error {err}");
        }
    }

    #[test]
    fn pair_entry_counts_only_successes_as_uses() {
        let key = PairKey::parse("alpha@beta").unwrap_or_else(|err| panic!("{err}"));
        let mut entry = PairEntry::first_use(&key, fixture_time(), false);
        assert_eq!((entry.use_count, entry.attempt_count, entry.success_count), (0, 1, 0));

        let later = fixture_time() + Duration::minutes(5);
        entry.record_use(later, true);
        assert_eq!((entry.use_count, entry.attempt_count, entry.success_count), (1, 2, 1));
        assert_eq!(entry.first_seen, fixture_time());
        assert_eq!(entry.last_used, later);
    }

    #[test]
    fn audit_entry_serializes_action_and_nullable_key() {
        let entry = AuditEntry::new(AuditAction::Batch, None, AuditContext::default())
            .with_error("1 of 3 scopes failed");
        let json = serde_json::to_value(&entry).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(json["action"], "batch");
        assert_eq!(json["key"], Value::Null);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "1 of 3 scopes failed");
    }

    #[test]
    fn truthiness_follows_json_emptiness() {
        assert!(is_truthy(&serde_json::json!(true)));
        assert!(is_truthy(&serde_json::json!(1)));
        assert!(is_truthy(&serde_json::json!("yes")));
        assert!(!is_truthy(&serde_json::json!(false)));
        assert!(!is_truthy(&serde_json::json!(0)));
        assert!(!is_truthy(&serde_json::json!("")));
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&serde_json::json!({})));
    }

    #[test]
    fn age_trim_never_drops_below_floor() {
        let stamps = vec![days_ago(10); 500];
        let request = TrimRequest { keep: None, older_than_days: Some(1) };
        let retained = plan_trim(&stamps, request, 1000, fixture_time());
        assert_eq!(retained, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn explicit_keep_overrides_floor() {
        let stamps = vec![days_ago(10); 500];
        let request = TrimRequest { keep: Some(10), older_than_days: None };
        let retained = plan_trim(&stamps, request, 1000, fixture_time());
        assert_eq!(retained, (490..500).collect::<Vec<_>>());
    }

    #[test]
    fn keep_is_applied_after_age_filter() {
        let mut stamps = vec![days_ago(10); 5];
        stamps.extend(vec![days_ago(0); 5]);
        let request = TrimRequest { keep: Some(3), older_than_days: Some(1) };
        assert_eq!(plan_trim(&stamps, request, 2, fixture_time()), vec![7, 8, 9]);

        let request = TrimRequest { keep: Some(8), older_than_days: Some(1) };
        assert_eq!(plan_trim(&stamps, request, 2, fixture_time()), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn unreadable_timestamps_survive_age_trim() {
        let stamps = vec![None, days_ago(30), days_ago(30), days_ago(0)];
        let request = TrimRequest { keep: None, older_than_days: Some(7) };
        assert_eq!(plan_trim(&stamps, request, 1, fixture_time()), vec![0, 3]);
    }

    #[test]
    fn floor_fallback_keeps_unreadable_entries_too() {
        let stamps = vec![None, days_ago(30), days_ago(30), days_ago(30)];
        let request = TrimRequest { keep: None, older_than_days: Some(7) };
        assert_eq!(plan_trim(&stamps, request, 2, fixture_time()), vec![0, 2, 3]);
    }

    #[test]
    fn age_beyond_the_calendar_removes_nothing() {
        let stamps = vec![Some(OffsetDateTime::UNIX_EPOCH); 3];
        for days in [5_000_000, u32::MAX] {
            let request = TrimRequest { keep: None, older_than_days: Some(days) };
            let retained = plan_trim(&stamps, request, 0, OffsetDateTime::UNIX_EPOCH);
            assert_eq!(retained, vec![0, 1, 2]);
        }

        let request = TrimRequest { keep: Some(1), older_than_days: Some(u32::MAX) };
        assert_eq!(plan_trim(&stamps, request, 0, fixture_time()), vec![2]);
    }

    #[test]
    fn auto_trim_triggers_only_above_twice_the_floor() {
        assert_eq!(plan_auto_trim(2000, 1000), None);
        assert_eq!(plan_auto_trim(2001, 1000), Some(1000));
        assert_eq!(plan_auto_trim(0, 0), None);
    }

    proptest! {
        #[test]
        fn appends_with_auto_trim_stay_bounded(floor in 1_usize..64, appends in 0_usize..600) {
            let mut count = 0_usize;
            for _ in 0..appends {
                count += 1;
                if let Some(keep) = plan_auto_trim(count, floor) {
                    count = keep;
                }
                prop_assert!(count <= floor * 2);
            }
            if appends > floor {
                prop_assert!(count >= floor);
            }
        }

        #[test]
        fn age_only_trim_keeps_min_of_floor_and_total(
            ages in proptest::collection::vec(0_i64..60, 0..200),
            floor in 0_usize..120,
            days in 0_u32..60,
        ) {
            let stamps = ages.iter().map(|age| days_ago(*age)).collect::<Vec<_>>();
            let request = TrimRequest { keep: None, older_than_days: Some(days) };
            let retained = plan_trim(&stamps, request, floor, fixture_time());
            prop_assert!(retained.len() >= floor.min(stamps.len()));
            prop_assert!(retained.windows(2).all(|pair| pair[0] < pair[1]));
        }

        #[test]
        fn keep_is_a_hard_cap(total in 0_usize..300, keep in 0_usize..300, floor in 0_usize..300) {
            let stamps = vec![days_ago(1); total];
            let request = TrimRequest { keep: Some(keep), older_than_days: None };
            let retained = plan_trim(&stamps, request, floor, fixture_time());
            prop_assert_eq!(retained.len(), keep.min(total));
        }
    }
}

//! Reading and rendering external settings documents.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use plugin_memory_core::is_truthy;
use serde_json::{Map, Value};

/// Key of the nested mapping that marks identities active.
pub const ENABLED_SET_KEY: &str = "enabledPlugins";

/// A settings file as found on disk.
#[derive(Debug, Clone)]
pub(crate) struct SettingsDocument {
    /// Exact bytes read, kept for backups. `None` when the file is absent.
    pub original: Option<Vec<u8>>,
    pub root: Map<String, Value>,
}

impl SettingsDocument {
    /// Read `path`. A missing file yields an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self { original: None, root: Map::new() });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read settings file {}", path.display()));
            }
        };

        let root = parse_root(&bytes)
            .with_context(|| format!("malformed settings file {}", path.display()))?;
        Ok(Self { original: Some(bytes), root })
    }

    pub fn exists(&self) -> bool {
        self.original.is_some()
    }

    /// The enabled set, or `None` when absent or not a mapping.
    pub fn enabled_set(&self) -> Option<&Map<String, Value>> {
        self.root.get(ENABLED_SET_KEY).and_then(Value::as_object)
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.enabled_set().and_then(|set| set.get(identity)).is_some_and(is_truthy)
    }

    /// Every identity with a truthy flag, in file order.
    pub fn active_identities(&self) -> Vec<&str> {
        self.enabled_set()
            .map(|set| {
                set.iter()
                    .filter(|(_, flag)| is_truthy(flag))
                    .map(|(identity, _)| identity.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set `identity` to `true`, creating the enabled set when absent.
    /// Returns whether the document changed.
    pub fn enable(&mut self, identity: &str) -> Result<bool> {
        if self.is_active(identity) {
            return Ok(false);
        }
        let slot = self
            .root
            .entry(ENABLED_SET_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(set) = slot.as_object_mut() else {
            bail!("`{ENABLED_SET_KEY}` is not a JSON object");
        };
        set.insert(identity.to_string(), Value::Bool(true));
        Ok(true)
    }

    /// Remove an active `identity` from the enabled set. Returns whether the
    /// document changed.
    pub fn disable(&mut self, identity: &str) -> bool {
        if !self.is_active(identity) {
            return false;
        }
        self.root
            .get_mut(ENABLED_SET_KEY)
            .and_then(Value::as_object_mut)
            .and_then(|set| set.shift_remove(identity))
            .is_some()
    }

    /// Two-space indented JSON with a trailing newline.
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec_pretty(&self.root).context("failed to serialize settings")?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn parse_root(bytes: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(root) => Ok(root),
        other => bail!("expected a JSON object at the top level, found {}", json_kind(&other)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

//! Runtime-typed configuration store.
//!
//! OCPP configuration is a heterogeneous key/value space: the Central System
//! reads and writes string-encoded values, the library needs typed access.
//! Every key is declared at startup with a default, an optional validator and
//! a readonly flag; writes from `ChangeConfiguration` are validated against
//! the declared type before they are accepted and persisted.

pub mod keys;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

/// A configuration value, typed at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::String(_) => "string",
        }
    }

    /// Wire encoding, as reported through `GetConfiguration`.
    pub fn encode(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::String(s) => s.clone(),
        }
    }

    /// Parse `raw` into the same variant as `self`.
    fn decode_as(&self, raw: &str) -> Option<ConfigValue> {
        match self {
            Self::Bool(_) => match raw {
                "true" | "True" | "TRUE" => Some(Self::Bool(true)),
                "false" | "False" | "FALSE" => Some(Self::Bool(false)),
                _ => None,
            },
            Self::Int(_) => raw.trim().parse::<i64>().ok().map(Self::Int),
            Self::String(_) => Some(Self::String(raw.to_string())),
        }
    }
}

/// Per-key validation hook. Returns `true` when the candidate value is
/// acceptable.
pub type Validator = fn(&ConfigValue) -> bool;

/// Any non-negative integer.
pub fn non_negative_int(v: &ConfigValue) -> bool {
    matches!(v, ConfigValue::Int(i) if *i >= 0)
}

/// A valid idTag: at most 20 characters.
pub fn id_tag_string(v: &ConfigValue) -> bool {
    matches!(v, ConfigValue::String(s) if s.chars().count() <= 20)
}

/// Outcome of a configuration write, mapping onto the OCPP
/// `ChangeConfiguration` response statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWriteOutcome {
    Accepted,
    Rejected,
    NotSupported,
}

struct ConfigEntry {
    value: ConfigValue,
    default: ConfigValue,
    readonly: bool,
    validator: Option<Validator>,
}

/// Durable string-pair storage behind the configuration store.
///
/// `write` must replace the single key atomically: concurrent readers (after
/// a crash, the next boot) see either the old or the new value, never a torn
/// record.
pub trait KeyValueStore {
    fn read_all(&mut self) -> Vec<(String, String)>;
    fn write(&mut self, key: &str, value: &str);
}

/// Typed, validated key/value store with persistence.
pub struct ConfigurationStore {
    entries: BTreeMap<String, ConfigEntry>,
    persisted: HashMap<String, String>,
    persist: Box<dyn KeyValueStore>,
}

impl ConfigurationStore {
    pub fn new(mut persist: Box<dyn KeyValueStore>) -> Self {
        let persisted = persist.read_all().into_iter().collect();
        Self {
            entries: BTreeMap::new(),
            persisted,
            persist,
        }
    }

    /// Declare `key` with a factory default. A persisted value of the same
    /// type (passing the validator, if any) overrides the default.
    pub fn declare(&mut self, key: &str, default: ConfigValue) {
        self.declare_entry(key, default, false, None);
    }

    pub fn declare_validated(&mut self, key: &str, default: ConfigValue, validator: Validator) {
        self.declare_entry(key, default, false, Some(validator));
    }

    pub fn declare_readonly(&mut self, key: &str, default: ConfigValue) {
        self.declare_entry(key, default, true, None);
    }

    fn declare_entry(
        &mut self,
        key: &str,
        default: ConfigValue,
        readonly: bool,
        validator: Option<Validator>,
    ) {
        if self.entries.contains_key(key) {
            return;
        }
        let mut value = default.clone();
        if let Some(raw) = self.persisted.get(key) {
            match default.decode_as(raw) {
                Some(decoded) if validator.map_or(true, |v| v(&decoded)) => value = decoded,
                _ => warn!(key, raw, "Ignoring invalid persisted configuration value"),
            }
        }
        self.entries.insert(
            key.to_string(),
            ConfigEntry {
                value,
                default,
                readonly,
                validator,
            },
        );
    }

    /// Typed accessor; falls back to the declared default on type mismatch
    /// and to `false` for undeclared keys.
    pub fn bool_of(&self, key: &str) -> bool {
        match self.entries.get(key).map(|e| (&e.value, &e.default)) {
            Some((ConfigValue::Bool(b), _)) => *b,
            Some((_, ConfigValue::Bool(b))) => {
                debug_assert!(false, "config key {key} is not a bool");
                *b
            }
            _ => {
                debug_assert!(false, "config key {key} is not declared as bool");
                false
            }
        }
    }

    /// Typed accessor; falls back to the declared default on type mismatch
    /// and to `0` for undeclared keys.
    pub fn int_of(&self, key: &str) -> i64 {
        match self.entries.get(key).map(|e| (&e.value, &e.default)) {
            Some((ConfigValue::Int(i), _)) => *i,
            Some((_, ConfigValue::Int(i))) => {
                debug_assert!(false, "config key {key} is not an int");
                *i
            }
            _ => {
                debug_assert!(false, "config key {key} is not declared as int");
                0
            }
        }
    }

    /// Typed accessor; falls back to the declared default on type mismatch
    /// and to `""` for undeclared keys.
    pub fn string_of(&self, key: &str) -> String {
        match self.entries.get(key).map(|e| (&e.value, &e.default)) {
            Some((ConfigValue::String(s), _)) => s.clone(),
            Some((_, ConfigValue::String(s))) => {
                debug_assert!(false, "config key {key} is not a string");
                s.clone()
            }
            _ => {
                debug_assert!(false, "config key {key} is not declared as string");
                String::new()
            }
        }
    }

    /// Write path for `ChangeConfiguration`: respects readonly flags and
    /// validators, parses per the declared type.
    pub fn set_from_string(&mut self, key: &str, raw: &str) -> ConfigWriteOutcome {
        let Some(entry) = self.entries.get(key) else {
            return ConfigWriteOutcome::NotSupported;
        };
        if entry.readonly {
            return ConfigWriteOutcome::Rejected;
        }
        let Some(decoded) = entry.default.decode_as(raw) else {
            return ConfigWriteOutcome::Rejected;
        };
        if let Some(validator) = entry.validator {
            if !validator(&decoded) {
                return ConfigWriteOutcome::Rejected;
            }
        }
        self.store(key, decoded);
        ConfigWriteOutcome::Accepted
    }

    /// Library-internal write: bypasses the readonly flag (the library owns
    /// its persisted state) but keeps type and persistence discipline.
    pub(crate) fn store_internal(&mut self, key: &str, value: ConfigValue) {
        if let Some(entry) = self.entries.get(key) {
            if entry.default.type_name() != value.type_name() {
                debug_assert!(false, "config key {key} type mismatch on internal write");
                return;
            }
        } else {
            debug_assert!(false, "config key {key} not declared before internal write");
            return;
        }
        self.store(key, value);
    }

    fn store(&mut self, key: &str, value: ConfigValue) {
        let encoded = value.encode();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
        }
        self.persisted.insert(key.to_string(), encoded.clone());
        self.persist.write(key, &encoded);
        debug!(key, value = encoded.as_str(), "Configuration updated");
    }

    /// Whether `key` is declared.
    pub fn is_declared(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Wire-encoded value of `key`, if declared.
    pub fn value_as_string(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value.encode())
    }

    /// `(key, readonly, value)` triples for `GetConfiguration`.
    pub fn key_values(&self) -> Vec<(String, bool, String)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.readonly, e.value.encode()))
            .collect()
    }
}

/// In-memory persistence for development and testing.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    pairs: HashMap<String, String>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persisted pair, as if written in a previous session.
    pub fn preload(mut self, key: &str, value: &str) -> Self {
        self.pairs.insert(key.to_string(), value.to_string());
        self
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn read_all(&mut self) -> Vec<(String, String)> {
        self.pairs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn write(&mut self, key: &str, value: &str) {
        self.pairs.insert(key.to_string(), value.to_string());
    }
}

/// File-backed persistence: one JSON object, replaced atomically via a
/// temporary file and rename.
pub struct FileKeyValueStore {
    path: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> serde_json::Map<String, serde_json::Value> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => Default::default(),
        }
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn read_all(&mut self) -> Vec<(String, String)> {
        self.load()
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect()
    }

    fn write(&mut self, key: &str, value: &str) {
        let mut map = self.load();
        map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(&serde_json::Value::Object(map))
            .expect("JSON object serialization cannot fail");
        if let Err(e) = fs::write(&tmp, text).and_then(|_| fs::rename(&tmp, &self.path)) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigurationStore {
        ConfigurationStore::new(Box::new(MemoryKeyValueStore::new()))
    }

    #[test]
    fn typed_accessors_with_defaults() {
        let mut cfg = store();
        cfg.declare("A", ConfigValue::Bool(true));
        cfg.declare("B", ConfigValue::Int(42));
        cfg.declare("C", ConfigValue::String("x".into()));

        assert!(cfg.bool_of("A"));
        assert_eq!(cfg.int_of("B"), 42);
        assert_eq!(cfg.string_of("C"), "x");
    }

    #[test]
    fn change_configuration_outcomes() {
        let mut cfg = store();
        cfg.declare_validated("Timeout", ConfigValue::Int(30), non_negative_int);
        cfg.declare_readonly("Vendor", ConfigValue::String("vg".into()));

        assert_eq!(
            cfg.set_from_string("Timeout", "90"),
            ConfigWriteOutcome::Accepted
        );
        assert_eq!(cfg.int_of("Timeout"), 90);

        assert_eq!(
            cfg.set_from_string("Timeout", "-1"),
            ConfigWriteOutcome::Rejected
        );
        assert_eq!(
            cfg.set_from_string("Timeout", "soon"),
            ConfigWriteOutcome::Rejected
        );
        assert_eq!(
            cfg.set_from_string("Vendor", "other"),
            ConfigWriteOutcome::Rejected
        );
        assert_eq!(
            cfg.set_from_string("NoSuchKey", "1"),
            ConfigWriteOutcome::NotSupported
        );
    }

    #[test]
    fn persisted_value_overrides_default() {
        let kv = MemoryKeyValueStore::new().preload("Timeout", "120");
        let mut cfg = ConfigurationStore::new(Box::new(kv));
        cfg.declare_validated("Timeout", ConfigValue::Int(30), non_negative_int);
        assert_eq!(cfg.int_of("Timeout"), 120);
    }

    #[test]
    fn invalid_persisted_value_falls_back() {
        let kv = MemoryKeyValueStore::new().preload("Timeout", "-5");
        let mut cfg = ConfigurationStore::new(Box::new(kv));
        cfg.declare_validated("Timeout", ConfigValue::Int(30), non_negative_int);
        assert_eq!(cfg.int_of("Timeout"), 30);
    }

    #[test]
    fn id_tag_validator_enforces_length() {
        assert!(id_tag_string(&ConfigValue::String("A".repeat(20))));
        assert!(!id_tag_string(&ConfigValue::String("A".repeat(21))));
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut kv = FileKeyValueStore::new(&path);
        kv.write("HeartbeatInterval", "300");
        kv.write("FreeVendActive", "true");
        kv.write("HeartbeatInterval", "600");

        let mut reopened = FileKeyValueStore::new(&path);
        let mut pairs = reopened.read_all();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("FreeVendActive".to_string(), "true".to_string()),
                ("HeartbeatInterval".to_string(), "600".to_string()),
            ]
        );
    }
}

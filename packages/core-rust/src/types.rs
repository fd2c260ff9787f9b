//! Values, entries, and entry metadata.
//!
//! These are the representations shared by the in-memory container, the wire
//! (remote commands and responses) and the persistent store. A [`CacheEntry`]
//! is always a *whole* value; partial updates are expressed as a [`Delta`] and
//! are folded into a full value before they ever reach a store.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Keys are plain strings. Ownership is a function of the key's bytes.
pub type Key = String;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Generic runtime value stored under a key.
///
/// Supports all JSON-compatible types plus binary data. Maps use `BTreeMap`
/// for deterministic serialization order, which keeps encoded entries
/// byte-identical across nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => write!(f, "[{} items]", items.len()),
            Value::Map(m) => write!(f, "{{{} fields}}", m.len()),
        }
    }
}

/// Per-entry expiration and versioning metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Time-to-live from creation in milliseconds. `None` = immortal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifespan_ms: Option<u64>,
    /// Maximum idle time since last access in milliseconds. `None` = no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_ms: Option<u64>,
    /// Entry version assigned by a versioning transaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Metadata {
    /// Metadata for an entry that never expires.
    pub const IMMORTAL: Self = Self {
        lifespan_ms: None,
        max_idle_ms: None,
        version: None,
    };

    #[must_use]
    pub fn with_lifespan(mut self, lifespan_ms: u64) -> Self {
        self.lifespan_ms = Some(lifespan_ms);
        self
    }

    #[must_use]
    pub fn with_max_idle(mut self, max_idle_ms: u64) -> Self {
        self.max_idle_ms = Some(max_idle_ms);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Whether any expiration applies to entries carrying this metadata.
    #[must_use]
    pub fn can_expire(&self) -> bool {
        self.lifespan_ms.is_some() || self.max_idle_ms.is_some()
    }
}

/// A complete key/value pair with metadata and timestamps.
///
/// This is the unit held by the data container, shipped in remote-get
/// responses, and handed to the persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: Key,
    pub value: Value,
    pub metadata: Metadata,
    /// Wall-clock millis when this version of the entry was written.
    pub created_ms: i64,
    /// Wall-clock millis of the last read or write. Drives max-idle expiry.
    pub last_used_ms: i64,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(key: impl Into<Key>, value: Value, metadata: Metadata) -> Self {
        Self::new_at(key, value, metadata, now_millis())
    }

    /// Creates an entry stamped with an explicit time (tests, replays).
    #[must_use]
    pub fn new_at(key: impl Into<Key>, value: Value, metadata: Metadata, now: i64) -> Self {
        Self {
            key: key.into(),
            value,
            metadata,
            created_ms: now,
            last_used_ms: now,
        }
    }

    /// Absolute expiry time in millis, or `None` if the entry only expires
    /// through max-idle or never expires.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn expiry_time(&self) -> Option<i64> {
        self.metadata
            .lifespan_ms
            .map(|lifespan| self.created_ms.saturating_add(lifespan as i64))
    }

    /// Returns `true` if the entry has outlived its lifespan or max-idle time.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn is_expired(&self, now: i64) -> bool {
        if let Some(expiry) = self.expiry_time() {
            if expiry <= now {
                return true;
            }
        }
        if let Some(max_idle) = self.metadata.max_idle_ms {
            if self.last_used_ms.saturating_add(max_idle as i64) <= now {
                return true;
            }
        }
        false
    }

    /// Records a read access.
    pub fn touch(&mut self, now: i64) {
        self.last_used_ms = now;
    }
}

/// A partial update of a map-valued entry.
///
/// Field operations are applied in order; a `None` value removes the field.
/// Stores never see a `Delta`: it is folded into a whole [`Value`] first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub ops: Vec<(String, Option<Value>)>,
}

impl Delta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `field` to `value`.
    #[must_use]
    pub fn put(mut self, field: impl Into<String>, value: Value) -> Self {
        self.ops.push((field.into(), Some(value)));
        self
    }

    /// Removes `field`.
    #[must_use]
    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.ops.push((field.into(), None));
        self
    }

    /// Appends the operations of `other` after this delta's operations.
    pub fn extend(&mut self, other: &Delta) {
        self.ops.extend(other.ops.iter().cloned());
    }

    /// Folds this delta into `base`, producing a whole map value.
    ///
    /// A missing or non-map base is treated as an empty map.
    #[must_use]
    pub fn merge_into(&self, base: Option<&Value>) -> Value {
        let mut fields = match base {
            Some(Value::Map(m)) => m.clone(),
            _ => BTreeMap::new(),
        };
        for (field, op) in &self.ops {
            match op {
                Some(v) => {
                    fields.insert(field.clone(), v.clone());
                }
                None => {
                    fields.remove(field);
                }
            }
        }
        Value::Map(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immortal_entry_never_expires() {
        let e = CacheEntry::new_at("k", Value::Int(1), Metadata::IMMORTAL, 0);
        assert!(!e.is_expired(i64::MAX));
        assert_eq!(e.expiry_time(), None);
    }

    #[test]
    fn lifespan_expiry_is_inclusive() {
        let e = CacheEntry::new_at("k", Value::Int(1), Metadata::default().with_lifespan(100), 1000);
        assert_eq!(e.expiry_time(), Some(1100));
        assert!(!e.is_expired(1099));
        assert!(e.is_expired(1100));
    }

    #[test]
    fn max_idle_resets_on_touch() {
        let mut e =
            CacheEntry::new_at("k", Value::Int(1), Metadata::default().with_max_idle(50), 1000);
        assert!(!e.is_expired(1049));
        e.touch(1040);
        assert!(!e.is_expired(1080));
        assert!(e.is_expired(1090));
    }

    #[test]
    fn metadata_can_expire() {
        assert!(!Metadata::IMMORTAL.can_expire());
        assert!(Metadata::default().with_lifespan(1).can_expire());
        assert!(Metadata::default().with_max_idle(1).can_expire());
        assert!(!Metadata::default().with_version(3).can_expire());
    }

    #[test]
    fn delta_merges_into_existing_map() {
        let mut base = BTreeMap::new();
        base.insert("a".to_string(), Value::Int(1));
        base.insert("b".to_string(), Value::Int(2));
        let base = Value::Map(base);

        let merged = Delta::new()
            .put("c", Value::Int(3))
            .remove("a")
            .put("b", Value::Int(20))
            .merge_into(Some(&base));

        let Value::Map(fields) = merged else {
            panic!("expected map");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["b"], Value::Int(20));
        assert_eq!(fields["c"], Value::Int(3));
    }

    #[test]
    fn delta_on_missing_base_starts_empty() {
        let merged = Delta::new().put("x", Value::Bool(true)).merge_into(None);
        assert_eq!(
            merged,
            Value::Map(BTreeMap::from([("x".to_string(), Value::Bool(true))]))
        );
    }

    #[test]
    fn delta_on_scalar_base_replaces_it() {
        let merged = Delta::new().put("x", Value::Int(1)).merge_into(Some(&Value::Int(9)));
        assert!(matches!(merged, Value::Map(ref m) if m.len() == 1));
    }

    #[test]
    fn delta_ops_apply_in_order() {
        let mut d = Delta::new().put("f", Value::Int(1));
        d.extend(&Delta::new().remove("f"));
        let Value::Map(fields) = d.merge_into(None) else {
            panic!("expected map");
        };
        assert!(fields.is_empty());
    }

    #[test]
    fn entry_survives_msgpack() {
        let e = CacheEntry::new_at(
            "bin",
            Value::Bytes(vec![0xde, 0xad]),
            Metadata::default().with_lifespan(5).with_version(2),
            42,
        );
        let bytes = rmp_serde::to_vec_named(&e).unwrap();
        let back: CacheEntry = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::Bytes(vec![1, 2]).to_string(), "<2 bytes>");
    }
}

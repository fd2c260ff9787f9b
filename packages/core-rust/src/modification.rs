//! Store-facing mutations.
//!
//! A [`Modification`] is what a persistent store is asked to apply. It carries
//! no locking, transactional, or delta concerns: `Store` always holds a whole
//! entry.

use serde::{Deserialize, Serialize};

use crate::types::{CacheEntry, Key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Modification {
    Store(CacheEntry),
    Remove(Key),
    Clear,
}

impl Modification {
    /// The key affected, or `None` for `Clear`.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Modification::Store(entry) => Some(&entry.key),
            Modification::Remove(key) => Some(key),
            Modification::Clear => None,
        }
    }

    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Modification::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, Value};

    #[test]
    fn key_of_each_variant() {
        let store = Modification::Store(CacheEntry::new_at("a", Value::Int(1), Metadata::IMMORTAL, 0));
        assert_eq!(store.key(), Some("a"));
        assert!(store.is_store());
        assert_eq!(Modification::Remove("b".into()).key(), Some("b"));
        assert_eq!(Modification::Clear.key(), None);
        assert!(!Modification::Clear.is_store());
    }
}

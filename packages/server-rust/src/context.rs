//! Per-invocation context.

use std::collections::HashMap;

use gridcache_core::{Address, CacheEntry, Key};

/// Where an invocation came from and what it has looked up so far.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Member the invocation originated on.
    pub origin: Address,
    /// `true` on the originating node, `false` when serving a remote command.
    pub origin_local: bool,
    /// Whether the invocation runs inside a transaction.
    pub in_tx: bool,
    /// Entries fetched from remote owners before a write. `None` means the
    /// owner answered but had no entry.
    looked_up: HashMap<Key, Option<CacheEntry>>,
}

impl InvocationContext {
    #[must_use]
    pub fn local(origin: Address) -> Self {
        Self {
            origin,
            origin_local: true,
            in_tx: false,
            looked_up: HashMap::new(),
        }
    }

    #[must_use]
    pub fn remote(origin: Address) -> Self {
        Self {
            origin,
            origin_local: false,
            in_tx: false,
            looked_up: HashMap::new(),
        }
    }

    #[must_use]
    pub fn transactional(mut self) -> Self {
        self.in_tx = true;
        self
    }

    pub fn record_lookup(&mut self, key: impl Into<Key>, entry: Option<CacheEntry>) {
        self.looked_up.insert(key.into(), entry);
    }

    /// The remotely fetched entry for `key`. The outer `Option` is `None`
    /// when no lookup happened.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Option<&CacheEntry>> {
        self.looked_up.get(key).map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use gridcache_core::{Metadata, Value};

    use super::*;

    #[test]
    fn lookups_distinguish_absent_from_not_fetched() {
        let mut ctx = InvocationContext::local(Address::new("n1"));
        assert!(ctx.lookup("a").is_none());
        ctx.record_lookup("a", None);
        assert_eq!(ctx.lookup("a"), Some(None));
        ctx.record_lookup("b", Some(CacheEntry::new("b", Value::Int(1), Metadata::IMMORTAL)));
        assert!(matches!(ctx.lookup("b"), Some(Some(_))));
    }

    #[test]
    fn constructors_set_origin_flags() {
        assert!(InvocationContext::local(Address::new("n1")).origin_local);
        let remote = InvocationContext::remote(Address::new("n2")).transactional();
        assert!(!remote.origin_local);
        assert!(remote.in_tx);
    }
}

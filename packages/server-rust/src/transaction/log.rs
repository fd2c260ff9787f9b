//! Conversion of a transaction's write commands into store modifications.
//!
//! The log replays the commands in order and keeps one slot per key: a later
//! write to the same key replaces the earlier modification in place, so the
//! store sees each key once, at the position of its first write, carrying the
//! key's final state. A logged `Clear` drops everything before it. Deltas are
//! folded into whole entries before they are logged. The put count follows
//! the issued writes, not the collapsed slots.

use std::collections::{HashMap, HashSet};

use gridcache_core::{evaluate, CacheEntry, Key, KeyEffect, Modification, WriteCommand, WriteOp};
use tracing::trace;

/// What the log needs to know about the node building it.
pub trait LogSource {
    /// Value of `key` before the transaction touched it.
    fn base_entry(&self, key: &str) -> Option<CacheEntry>;

    /// Whether this node persists writes to `key`.
    fn is_proper_writer(&self, key: &str) -> bool;

    fn is_proper_writer_for_clear(&self) -> bool {
        true
    }

    /// Whether `cmd` may reach the store at all (skip flags).
    fn is_store_enabled_for(&self, _cmd: &WriteCommand) -> bool {
        true
    }

    /// Entry version assigned by the transaction.
    fn updated_version(&self, _key: &str) -> Option<u64> {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ModificationLog {
    modifications: Vec<Modification>,
    affected_keys: HashSet<Key>,
    put_count: u64,
}

impl ModificationLog {
    /// Builds the log for `commands`. `put_count` is only tracked when
    /// `count_puts` is set and counts every key written by a put, replace,
    /// bulk put or delta that reaches this node's store.
    pub fn build(commands: &[WriteCommand], source: &dyn LogSource, count_puts: bool, now: i64) -> Self {
        let mut log = Self::default();
        let mut slots: HashMap<Key, usize> = HashMap::new();
        let mut view: HashMap<Key, Option<CacheEntry>> = HashMap::new();
        let mut cleared = false;

        for cmd in commands {
            let enabled = source.is_store_enabled_for(cmd);
            if !enabled {
                trace!(command = cmd.name(), "store skipped for command");
            }

            if matches!(cmd.op, WriteOp::Clear) {
                view.clear();
                cleared = true;
                if enabled && source.is_proper_writer_for_clear() {
                    log.modifications.clear();
                    slots.clear();
                    log.modifications.push(Modification::Clear);
                }
                continue;
            }

            for key in cmd.keys() {
                let current = match view.get(key) {
                    Some(state) => state.clone(),
                    None if cleared => None,
                    None => source.base_entry(key),
                };
                let eval = evaluate(&cmd.op, key, current.as_ref(), true, now);
                let modification = match eval.effect {
                    KeyEffect::Write(mut entry) => {
                        if let Some(version) = source.updated_version(key) {
                            entry.metadata.version = Some(version);
                        }
                        view.insert(key.to_string(), Some(entry.clone()));
                        Some(Modification::Store(entry))
                    }
                    KeyEffect::Remove => {
                        view.insert(key.to_string(), None);
                        Some(Modification::Remove(key.to_string()))
                    }
                    KeyEffect::Unchanged if matches!(cmd.op, WriteOp::Remove { .. }) => {
                        Some(Modification::Remove(key.to_string()))
                    }
                    KeyEffect::Unchanged => None,
                };

                let Some(modification) = modification else {
                    continue;
                };
                if !enabled || !source.is_proper_writer(key) {
                    continue;
                }
                if count_puts && modification.is_store() {
                    log.put_count += 1;
                }
                match slots.get(key) {
                    Some(&slot) => log.modifications[slot] = modification,
                    None => {
                        slots.insert(key.to_string(), log.modifications.len());
                        log.modifications.push(modification);
                    }
                }
                log.affected_keys.insert(key.to_string());
            }
        }

        trace!(
            modifications = log.modifications.len(),
            puts = log.put_count,
            "converted commands to store modifications"
        );
        log
    }

    #[must_use]
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    #[must_use]
    pub fn affected_keys(&self) -> &HashSet<Key> {
        &self.affected_keys
    }

    #[must_use]
    pub fn into_affected_keys(self) -> HashSet<Key> {
        self.affected_keys
    }

    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.put_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modifications.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gridcache_core::{Delta, Flag, Flags, Metadata, Value};

    use super::*;

    #[derive(Default)]
    struct Source {
        base: HashMap<Key, CacheEntry>,
        not_writer: HashSet<Key>,
        versions: HashMap<Key, u64>,
    }

    impl LogSource for Source {
        fn base_entry(&self, key: &str) -> Option<CacheEntry> {
            self.base.get(key).cloned()
        }

        fn is_proper_writer(&self, key: &str) -> bool {
            !self.not_writer.contains(key)
        }

        fn is_store_enabled_for(&self, cmd: &WriteCommand) -> bool {
            !cmd.has_flag(Flag::SkipCacheStore)
        }

        fn updated_version(&self, key: &str) -> Option<u64> {
            self.versions.get(key).copied()
        }
    }

    fn put(key: &str, v: i64) -> WriteCommand {
        WriteCommand::new(WriteOp::Put {
            key: key.into(),
            value: Value::Int(v),
            metadata: Metadata::IMMORTAL,
            if_absent: false,
        })
    }

    fn remove(key: &str) -> WriteCommand {
        WriteCommand::new(WriteOp::Remove {
            key: key.into(),
            expected: None,
        })
    }

    fn stored(m: &Modification) -> (&str, &Value) {
        match m {
            Modification::Store(e) => (&e.key, &e.value),
            other => panic!("expected store, got {other:?}"),
        }
    }

    #[test]
    fn store_then_remove_in_order() {
        let log = ModificationLog::build(&[put("k1", 1), remove("k2")], &Source::default(), true, 0);
        assert_eq!(log.len(), 2);
        assert_eq!(stored(&log.modifications()[0]), ("k1", &Value::Int(1)));
        assert_eq!(log.modifications()[1], Modification::Remove("k2".into()));
        assert_eq!(log.put_count(), 1);
        assert_eq!(log.affected_keys().len(), 2);
    }

    #[test]
    fn repeated_writes_collapse_to_final_state() {
        let log = ModificationLog::build(
            &[put("a", 1), put("b", 2), put("a", 3), remove("b")],
            &Source::default(),
            true,
            0,
        );
        assert_eq!(log.len(), 2);
        assert_eq!(stored(&log.modifications()[0]), ("a", &Value::Int(3)));
        assert_eq!(log.modifications()[1], Modification::Remove("b".into()));
        assert_eq!(log.put_count(), 3);
    }

    #[test]
    fn every_issued_put_is_counted() {
        let log = ModificationLog::build(&[put("k", 1), put("k", 2), put("k", 3)], &Source::default(), true, 0);
        assert_eq!(log.len(), 1);
        assert_eq!(stored(&log.modifications()[0]), ("k", &Value::Int(3)));
        assert_eq!(log.put_count(), 3);

        let log = ModificationLog::build(
            &[put("k", 1), remove("k"), WriteCommand::new(WriteOp::Clear), put("j", 2)],
            &Source::default(),
            true,
            0,
        );
        assert_eq!(log.put_count(), 2);
    }

    #[test]
    fn clear_drops_earlier_modifications() {
        let log = ModificationLog::build(
            &[put("a", 1), WriteCommand::new(WriteOp::Clear), put("b", 2)],
            &Source::default(),
            true,
            0,
        );
        assert_eq!(log.modifications()[0], Modification::Clear);
        assert_eq!(stored(&log.modifications()[1]), ("b", &Value::Int(2)));
        assert!(log.affected_keys().contains("a"));
    }

    #[test]
    fn delta_is_normalised_against_base() {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), Value::Int(1));
        let mut source = Source::default();
        source.base.insert(
            "m".into(),
            CacheEntry::new_at("m", Value::Map(fields), Metadata::IMMORTAL, 0),
        );
        let delta = WriteCommand::new(WriteOp::ApplyDelta {
            key: "m".into(),
            delta: Delta::new().put("y", Value::Int(2)),
        });
        let log = ModificationLog::build(&[delta], &source, true, 0);
        let (_, value) = stored(&log.modifications()[0]);
        let Value::Map(fields) = value else {
            panic!("expected map");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(log.put_count(), 1);
    }

    #[test]
    fn non_writers_and_skipped_commands_are_left_out() {
        let mut source = Source::default();
        source.not_writer.insert("a".into());
        let skipped = put("c", 3).with_flags(Flags::of(&[Flag::SkipCacheStore]));
        let log = ModificationLog::build(&[put("a", 1), put("b", 2), skipped], &source, true, 0);
        assert_eq!(log.len(), 1);
        assert_eq!(stored(&log.modifications()[0]).0, "b");
        assert!(!log.affected_keys().contains("a"));
        assert_eq!(log.put_count(), 1);
    }

    #[test]
    fn put_all_logs_every_key_and_versions_apply() {
        let mut source = Source::default();
        source.versions.insert("y".into(), 7);
        let cmd = WriteCommand::new(WriteOp::PutAll {
            entries: vec![("x".into(), Value::Int(1)), ("y".into(), Value::Int(2))],
            metadata: Metadata::IMMORTAL,
        });
        let log = ModificationLog::build(&[cmd], &source, true, 0);
        assert_eq!(log.put_count(), 2);
        match &log.modifications()[1] {
            Modification::Store(e) => assert_eq!(e.metadata.version, Some(7)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn statistics_off_means_no_put_count() {
        let log = ModificationLog::build(&[put("a", 1)], &Source::default(), false, 0);
        assert_eq!(log.put_count(), 0);
        assert!(!log.is_empty());
    }
}

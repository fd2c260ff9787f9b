//! Transaction-local state.
//!
//! A [`CacheTransaction`] buffers the successful write commands of one
//! transaction, in order, together with the transaction's own view of every
//! key it touched. Nothing reaches the data container or the store until
//! the transaction commits.

use std::collections::{BTreeMap, HashMap};

use gridcache_core::{evaluate, CacheEntry, CommandOutcome, Key, KeyEffect, WriteCommand, WriteOp};

use super::id::GlobalTransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
}

impl TxState {
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

#[derive(Debug)]
pub struct CacheTransaction {
    gtx: GlobalTransactionId,
    state: TxState,
    commands: Vec<WriteCommand>,
    /// Value of each key before the transaction first touched it.
    originals: HashMap<Key, Option<CacheEntry>>,
    /// The transaction's current view of each key it wrote.
    view: HashMap<Key, Option<CacheEntry>>,
    key_order: Vec<Key>,
    cleared: bool,
    versions: BTreeMap<Key, u64>,
}

impl CacheTransaction {
    #[must_use]
    pub fn new(gtx: GlobalTransactionId) -> Self {
        Self {
            gtx,
            state: TxState::Active,
            commands: Vec::new(),
            originals: HashMap::new(),
            view: HashMap::new(),
            key_order: Vec::new(),
            cleared: false,
            versions: BTreeMap::new(),
        }
    }

    /// Rebuilds a transaction on a participant from the originator's
    /// commands. The commands already succeeded on the originator, so their
    /// conditions are not re-evaluated.
    pub fn replay(
        gtx: GlobalTransactionId,
        commands: Vec<WriteCommand>,
        versions: BTreeMap<Key, u64>,
        base: impl Fn(&str) -> Option<CacheEntry>,
        now: i64,
    ) -> Self {
        let mut tx = Self::new(gtx);
        for cmd in &commands {
            for key in cmd.keys() {
                if tx.needs_original(key) {
                    tx.record_original(key, base(key));
                }
            }
            tx.execute(cmd, true, now);
        }
        tx.commands = commands;
        tx.versions = versions;
        tx
    }

    #[must_use]
    pub fn gtx(&self) -> &GlobalTransactionId {
        &self.gtx
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    /// Successful write commands, in issue order.
    #[must_use]
    pub fn commands(&self) -> &[WriteCommand] {
        &self.commands
    }

    #[must_use]
    pub fn has_modifications(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Whether the transaction still needs the pre-transaction value of
    /// `key` before it can evaluate a command on it.
    #[must_use]
    pub fn needs_original(&self, key: &str) -> bool {
        !self.cleared && !self.view.contains_key(key) && !self.originals.contains_key(key)
    }

    pub fn record_original(&mut self, key: &str, entry: Option<CacheEntry>) {
        self.originals.entry(key.to_string()).or_insert(entry);
    }

    /// Pre-transaction value of `key`, if it was recorded.
    #[must_use]
    pub fn original(&self, key: &str) -> Option<CacheEntry> {
        self.originals.get(key).cloned().flatten()
    }

    /// The transaction's view of `key`. `None` when the transaction knows
    /// nothing about it and the committed value applies.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Option<&CacheEntry>> {
        match self.view.get(key) {
            Some(state) => Some(state.as_ref()),
            None if self.cleared => Some(None),
            None => self.originals.get(key).map(Option::as_ref),
        }
    }

    /// Evaluates `cmd` against the transaction's view and records it when
    /// it succeeds.
    pub fn apply(&mut self, mut cmd: WriteCommand, now: i64) -> CommandOutcome {
        let outcome = self.execute(&cmd, false, now);
        cmd.set_successful(outcome.successful);
        if outcome.successful {
            self.commands.push(cmd);
        }
        outcome
    }

    fn execute(&mut self, cmd: &WriteCommand, force: bool, now: i64) -> CommandOutcome {
        if matches!(cmd.op, WriteOp::Clear) {
            self.cleared = true;
            for state in self.view.values_mut() {
                *state = None;
            }
            return CommandOutcome::applied(None);
        }

        let keys: Vec<Key> = cmd.keys().into_iter().map(str::to_string).collect();
        let mut outcome = CommandOutcome::applied(None);
        for (i, key) in keys.iter().enumerate() {
            let current = self.lookup(key).map(|e| e.cloned()).unwrap_or_default();
            let eval = evaluate(&cmd.op, key, current.as_ref(), force, now);
            if i == 0 {
                outcome = eval.outcome.clone();
            }
            if !eval.outcome.successful {
                return eval.outcome;
            }
            let next = match eval.effect {
                KeyEffect::Unchanged => continue,
                KeyEffect::Write(entry) => Some(entry),
                KeyEffect::Remove => None,
            };
            if !self.view.contains_key(key) {
                self.key_order.push(key.clone());
            }
            self.view.insert(key.clone(), next);
        }
        outcome
    }

    /// Assigns the next entry version to every key the transaction writes.
    pub fn assign_versions(&mut self) {
        for key in &self.key_order {
            if let Some(Some(_)) = self.view.get(key) {
                let previous = self
                    .originals
                    .get(key)
                    .and_then(|e| e.as_ref())
                    .and_then(|e| e.metadata.version)
                    .unwrap_or(0);
                self.versions.insert(key.clone(), previous + 1);
            }
        }
    }

    #[must_use]
    pub fn versions(&self) -> &BTreeMap<Key, u64> {
        &self.versions
    }

    /// Version assigned to `key` by [`assign_versions`](Self::assign_versions)
    /// or by the originator.
    #[must_use]
    pub fn updated_version(&self, key: &str) -> Option<u64> {
        self.versions.get(key).copied()
    }

    /// Whether the transaction cleared the cache.
    #[must_use]
    pub fn cleared(&self) -> bool {
        self.cleared
    }

    /// Final state of every written key, in first-write order, with
    /// assigned versions applied.
    #[must_use]
    pub fn final_states(&self) -> Vec<(Key, Option<CacheEntry>)> {
        self.key_order
            .iter()
            .filter_map(|key| {
                let state = self.view.get(key)?.clone().map(|mut entry| {
                    if let Some(v) = self.updated_version(key) {
                        entry.metadata.version = Some(v);
                    }
                    entry
                });
                Some((key.clone(), state))
            })
            .collect()
    }

    /// Every key written, in first-write order.
    #[must_use]
    pub fn written_keys(&self) -> &[Key] {
        &self.key_order
    }
}

#[cfg(test)]
mod tests {
    use gridcache_core::{Address, Delta, Metadata, Value};

    use super::*;

    fn tx() -> CacheTransaction {
        CacheTransaction::new(GlobalTransactionId::new(Address::new("n1")))
    }

    fn put(key: &str, v: i64) -> WriteCommand {
        WriteCommand::new(WriteOp::Put {
            key: key.into(),
            value: Value::Int(v),
            metadata: Metadata::IMMORTAL,
            if_absent: false,
        })
    }

    #[test]
    fn writes_are_visible_inside_the_transaction() {
        let mut t = tx();
        t.record_original("a", None);
        let outcome = t.apply(put("a", 1), 0);
        assert!(outcome.successful);
        assert_eq!(t.lookup("a").unwrap().unwrap().value, Value::Int(1));
        assert_eq!(t.commands().len(), 1);
        assert_eq!(t.state(), TxState::Active);
    }

    #[test]
    fn failed_conditions_are_not_recorded() {
        let mut t = tx();
        t.record_original("a", Some(CacheEntry::new_at("a", Value::Int(1), Metadata::IMMORTAL, 0)));
        let cmd = WriteCommand::new(WriteOp::Put {
            key: "a".into(),
            value: Value::Int(2),
            metadata: Metadata::IMMORTAL,
            if_absent: true,
        });
        let outcome = t.apply(cmd, 0);
        assert!(!outcome.successful);
        assert_eq!(outcome.previous, Some(Value::Int(1)));
        assert!(!t.has_modifications());
    }

    #[test]
    fn clear_hides_originals() {
        let mut t = tx();
        t.record_original("a", Some(CacheEntry::new_at("a", Value::Int(1), Metadata::IMMORTAL, 0)));
        t.apply(WriteCommand::new(WriteOp::Clear), 0);
        assert_eq!(t.lookup("a"), Some(None));
        assert!(!t.needs_original("b"));
        assert!(t.cleared());
    }

    #[test]
    fn versions_increment_from_originals() {
        let mut t = tx();
        t.record_original(
            "a",
            Some(CacheEntry::new_at("a", Value::Int(1), Metadata::IMMORTAL.with_version(4), 0)),
        );
        t.record_original("b", None);
        t.apply(put("a", 2), 0);
        t.apply(put("b", 3), 0);
        t.assign_versions();
        assert_eq!(t.updated_version("a"), Some(5));
        assert_eq!(t.updated_version("b"), Some(1));
        let states = t.final_states();
        assert_eq!(states[0].1.as_ref().unwrap().metadata.version, Some(5));
    }

    #[test]
    fn replay_applies_without_conditions() {
        let delta = WriteCommand::new(WriteOp::ApplyDelta {
            key: "m".into(),
            delta: Delta::new().put("f", Value::Int(1)),
        });
        let t = CacheTransaction::replay(
            GlobalTransactionId::new(Address::new("n1")),
            vec![put("a", 1), delta],
            BTreeMap::new(),
            |_| None,
            0,
        );
        assert_eq!(t.commands().len(), 2);
        assert_eq!(t.written_keys(), &["a".to_string(), "m".to_string()]);
        assert!(matches!(t.lookup("m"), Some(Some(e)) if matches!(e.value, Value::Map(_))));
    }
}

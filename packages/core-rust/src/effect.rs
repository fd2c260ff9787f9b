//! What a write operation does to one key.
//!
//! [`evaluate`] is the single place where operation semantics live. The
//! in-memory apply path, the transactional context, and the modification log
//! all call it, so a `Replace` means the same thing whether it runs against
//! the data container or inside a transaction being prepared.

use crate::command::{CommandOutcome, WriteOp};
use crate::types::{CacheEntry, Metadata};

/// The state change an operation produces for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyEffect {
    Unchanged,
    Write(CacheEntry),
    Remove,
}

/// Outcome plus effect of evaluating an operation against one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: CommandOutcome,
    pub effect: KeyEffect,
}

impl Evaluation {
    fn applied(current: Option<&CacheEntry>, effect: KeyEffect) -> Self {
        Self {
            outcome: CommandOutcome::applied(current.map(|e| e.value.clone())),
            effect,
        }
    }

    fn rejected(current: Option<&CacheEntry>) -> Self {
        Self {
            outcome: CommandOutcome::rejected(current.map(|e| e.value.clone())),
            effect: KeyEffect::Unchanged,
        }
    }
}

/// Evaluates `op` for `key` given the key's current entry.
///
/// With `force` set, conditions are not re-checked: the caller is applying a
/// decision already taken elsewhere (a backup applying what its primary
/// replicated, or a prepared transaction replaying its successful writes).
#[must_use]
pub fn evaluate(
    op: &WriteOp,
    key: &str,
    current: Option<&CacheEntry>,
    force: bool,
    now: i64,
) -> Evaluation {
    match op {
        WriteOp::Put {
            value,
            metadata,
            if_absent,
            ..
        } => {
            if *if_absent && current.is_some() && !force {
                return Evaluation::rejected(current);
            }
            let entry = CacheEntry::new_at(key, value.clone(), metadata.clone(), now);
            Evaluation::applied(current, KeyEffect::Write(entry))
        }
        WriteOp::Remove { expected, .. } => match (current, expected) {
            (None, Some(_)) if !force => Evaluation::rejected(None),
            (Some(entry), Some(v)) if !force && entry.value != *v => {
                Evaluation::rejected(current)
            }
            (None, _) => Evaluation::applied(None, KeyEffect::Unchanged),
            (Some(_), _) => Evaluation::applied(current, KeyEffect::Remove),
        },
        WriteOp::Replace {
            expected,
            value,
            metadata,
            ..
        } => {
            if !force {
                match (current, expected) {
                    (None, _) => return Evaluation::rejected(None),
                    (Some(entry), Some(v)) if entry.value != *v => {
                        return Evaluation::rejected(current)
                    }
                    _ => {}
                }
            }
            let entry = CacheEntry::new_at(key, value.clone(), metadata.clone(), now);
            Evaluation::applied(current, KeyEffect::Write(entry))
        }
        WriteOp::PutAll { entries, metadata } => {
            match entries.iter().rev().find(|(k, _)| k == key) {
                Some((_, value)) => {
                    let entry = CacheEntry::new_at(key, value.clone(), metadata.clone(), now);
                    Evaluation::applied(current, KeyEffect::Write(entry))
                }
                None => Evaluation::applied(current, KeyEffect::Unchanged),
            }
        }
        WriteOp::ApplyDelta { delta, .. } => {
            let merged = delta.merge_into(current.map(|e| &e.value));
            let metadata = current.map_or(Metadata::IMMORTAL, |e| e.metadata.clone());
            let mut entry = CacheEntry::new_at(key, merged, metadata, now);
            if let Some(existing) = current {
                entry.created_ms = existing.created_ms;
            }
            Evaluation::applied(current, KeyEffect::Write(entry))
        }
        WriteOp::Clear => match current {
            Some(_) => Evaluation::applied(current, KeyEffect::Remove),
            None => Evaluation::applied(None, KeyEffect::Unchanged),
        },
    }
}

// 🔑 Entity Reconciler - one canonical row per entity key
// Shared by every dataset: directory, IPS, exams, enrollment, elections, mayors

use crate::normalizer::NormalizedRow;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

// ============================================================================
// ENTITY KEY
// ============================================================================

/// National identifier of a school (UAI) or a commune (INSEE code).
///
/// Only constructible through the validating constructors, so a malformed
/// key can never reach a join.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// UAI: 7 digits + 1 letter, e.g. "0440021J". The letter is upper-cased.
    pub fn uai(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bytes = trimmed.as_bytes();
        if bytes.len() != 8 {
            return None;
        }
        if !bytes[..7].iter().all(u8::is_ascii_digit) || !bytes[7].is_ascii_alphabetic() {
            return None;
        }
        Some(EntityKey(trimmed.to_ascii_uppercase()))
    }

    /// INSEE commune code: exactly 5 digits (2 department + 3 commune)
    pub fn insee(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == 5 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(EntityKey(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which identifier family a dataset is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Uai,
    Insee,
}

impl KeyKind {
    pub fn parse(&self, raw: &str) -> Option<EntityKey> {
        match self {
            KeyKind::Uai => EntityKey::uai(raw),
            KeyKind::Insee => EntityKey::insee(raw),
        }
    }

    /// Key extractor reading `field` from a normalized row
    pub fn key_of(self, field: &str) -> impl Fn(&NormalizedRow) -> Option<EntityKey> {
        let field = field.to_string();
        move |row: &NormalizedRow| {
            let raw = match row.get(&field)? {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            self.parse(&raw)
        }
    }
}

// ============================================================================
// PRIORITY POLICIES
// ============================================================================

/// Outcome of comparing the stored row with a new candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    KeepExisting,
    TakeCandidate,
}

/// Decides which of two rows sharing a key survives
pub trait Priority<T> {
    fn choose(&self, existing: &T, candidate: &T) -> Choice;
}

impl<T, F> Priority<T> for F
where
    F: Fn(&T, &T) -> Choice,
{
    fn choose(&self, existing: &T, candidate: &T) -> Choice {
        self(existing, candidate)
    }
}

/// Most-recent-wins on a year/session string field.
///
/// French administrative years sort correctly as plain strings
/// ("2023-2024" > "2022-2023"). A missing year compares as "".
/// The candidate wins ties.
#[derive(Debug, Clone)]
pub struct MostRecent {
    pub field: String,
}

impl MostRecent {
    pub fn new(field: &str) -> Self {
        MostRecent { field: field.to_string() }
    }
}

impl Priority<NormalizedRow> for MostRecent {
    fn choose(&self, existing: &NormalizedRow, candidate: &NormalizedRow) -> Choice {
        let old = existing.year(&self.field).unwrap_or_default();
        let new = candidate.year(&self.field).unwrap_or_default();
        if new >= old {
            Choice::TakeCandidate
        } else {
            Choice::KeepExisting
        }
    }
}

/// First-wins: used where upstream is already deduplicated and a repeated
/// key is an anomaly rather than an update
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstWins;

impl<T> Priority<T> for FirstWins {
    fn choose(&self, _existing: &T, _candidate: &T) -> Choice {
        Choice::KeepExisting
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Rows offered to the reconciler
    pub seen: usize,

    /// Rows without a valid key
    pub dropped_without_key: usize,

    /// Stored rows replaced by a candidate
    pub replaced: usize,

    /// Candidates rejected in favour of the stored row
    pub conflicts: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub entities: BTreeMap<EntityKey, T>,
    pub stats: ReconcileStats,
}

/// Reduce a stream of rows to one row per key.
///
/// Rows are visited in arrival order. `key_of` returning `None` drops the
/// row; the first row for a key is stored; later rows go through `priority`.
pub fn reconcile<T, K, P>(rows: impl IntoIterator<Item = T>, key_of: K, priority: &P) -> Reconciled<T>
where
    K: Fn(&T) -> Option<EntityKey>,
    P: Priority<T> + ?Sized,
{
    let mut entities: BTreeMap<EntityKey, T> = BTreeMap::new();
    let mut stats = ReconcileStats::default();

    for row in rows {
        stats.seen += 1;

        let key = match key_of(&row) {
            Some(k) => k,
            None => {
                stats.dropped_without_key += 1;
                continue;
            }
        };

        match entities.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => match priority.choose(slot.get(), &row) {
                Choice::TakeCandidate => {
                    slot.insert(row);
                    stats.replaced += 1;
                }
                Choice::KeepExisting => {
                    debug!(key = %slot.key(), "duplicate key, keeping stored row");
                    stats.conflicts += 1;
                }
            },
        }
    }

    Reconciled { entities, stats }
}

// ============================================================================
// SINGLE-READ-PER-KEY VALUES
// ============================================================================

/// A value that is constant across all rows sharing a key, read once.
///
/// Electoral "expressed votes" repeat on every candidate row of a commune;
/// adding them up per row inflates the denominator. Values recorded here are
/// kept from the first row of each key, and later rows only count as a
/// mismatch when they disagree.
#[derive(Debug, Clone, Default)]
pub struct KeyedConstant<K: Ord> {
    values: BTreeMap<K, i64>,
    mismatches: usize,
}

impl<K: Ord> KeyedConstant<K> {
    pub fn new() -> Self {
        KeyedConstant {
            values: BTreeMap::new(),
            mismatches: 0,
        }
    }

    /// Record the value for `key` if none is known yet; returns the stored value
    pub fn observe(&mut self, key: K, value: i64) -> i64 {
        match self.values.entry(key) {
            Entry::Vacant(slot) => *slot.insert(value),
            Entry::Occupied(slot) => {
                if *slot.get() != value {
                    debug!(stored = *slot.get(), value, "per-key constant disagrees, keeping first read");
                    self.mismatches += 1;
                }
                *slot.get()
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<i64> {
        self.values.get(key).copied()
    }

    pub fn mismatches(&self) -> usize {
        self.mismatches
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &i64)> {
        self.values.iter()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment_row(uai: &str, rentree: &str, students: i64) -> NormalizedRow {
        NormalizedRow::new()
            .with("numero_ecole", uai)
            .with("rentree_scolaire", rentree)
            .with("nombre_total_eleves", students)
    }

    #[test]
    fn test_uai_format() {
        assert_eq!(EntityKey::uai("0440021J").unwrap().as_str(), "0440021J");
        assert_eq!(EntityKey::uai(" 0440021j ").unwrap().as_str(), "0440021J");
        assert!(EntityKey::uai("044002J").is_none());
        assert!(EntityKey::uai("04400211").is_none());
        assert!(EntityKey::uai("A440021J").is_none());
        assert!(EntityKey::uai("").is_none());
    }

    #[test]
    fn test_insee_format() {
        assert_eq!(EntityKey::insee("44109").unwrap().as_str(), "44109");
        assert!(EntityKey::insee("4410").is_none());
        assert!(EntityKey::insee("4444001").is_none());
        assert!(EntityKey::insee("2A004").is_none());
    }

    #[test]
    fn test_most_recent_wins() {
        let rows = vec![
            enrollment_row("0440021J", "2022-2023", 200),
            enrollment_row("0440021J", "2023-2024", 210),
            enrollment_row("0440021J", "2021-2022", 190),
            enrollment_row("0490001K", "2021-2022", 90),
        ];

        let kind = KeyKind::Uai;
        let result = reconcile(rows.clone(), kind.key_of("numero_ecole"), &MostRecent::new("rentree_scolaire"));

        assert_eq!(result.entities.len(), 2);
        let kept = &result.entities[&EntityKey::uai("0440021J").unwrap()];
        assert_eq!(kept.year("rentree_scolaire").as_deref(), Some("2023-2024"));
        assert_eq!(kept.integer("nombre_total_eleves"), Some(210));

        // stored recency is >= every candidate sharing the key
        for row in &rows {
            let key = kind.key_of("numero_ecole")(row).unwrap();
            let stored = result.entities[&key].year("rentree_scolaire").unwrap();
            assert!(stored >= row.year("rentree_scolaire").unwrap());
        }
    }

    #[test]
    fn test_most_recent_candidate_wins_ties() {
        let rows = vec![
            enrollment_row("0440021J", "2023-2024", 200),
            enrollment_row("0440021J", "2023-2024", 205),
        ];

        let result = reconcile(rows, KeyKind::Uai.key_of("numero_ecole"), &MostRecent::new("rentree_scolaire"));
        let kept = &result.entities[&EntityKey::uai("0440021J").unwrap()];
        assert_eq!(kept.integer("nombre_total_eleves"), Some(205));
        assert_eq!(result.stats.replaced, 1);
    }

    #[test]
    fn test_first_wins_counts_conflicts() {
        let rows = vec![
            enrollment_row("0440021J", "2023-2024", 200),
            enrollment_row("0440021J", "2024-2025", 205),
        ];

        let result = reconcile(rows, KeyKind::Uai.key_of("numero_ecole"), &FirstWins);
        let kept = &result.entities[&EntityKey::uai("0440021J").unwrap()];
        assert_eq!(kept.integer("nombre_total_eleves"), Some(200));
        assert_eq!(result.stats.conflicts, 1);
        assert_eq!(result.stats.replaced, 0);
    }

    #[test]
    fn test_malformed_keys_drop_only_their_row() {
        let rows = vec![
            enrollment_row("BAD", "2023-2024", 1),
            NormalizedRow::new().with("rentree_scolaire", "2023-2024"),
            enrollment_row("0440021J", "2023-2024", 200),
        ];

        let result = reconcile(rows, KeyKind::Uai.key_of("numero_ecole"), &FirstWins);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.stats.seen, 3);
        assert_eq!(result.stats.dropped_without_key, 2);
    }

    #[test]
    fn test_closure_priority() {
        let rows: Vec<(i32, String)> = vec![(1, "a".into()), (1, "bbb".into()), (1, "cc".into())];
        let longest = |old: &(i32, String), new: &(i32, String)| {
            if new.1.len() > old.1.len() {
                Choice::TakeCandidate
            } else {
                Choice::KeepExisting
            }
        };

        let result = reconcile(rows, |_| EntityKey::insee("44109"), &longest);
        assert_eq!(result.entities.values().next().unwrap().1, "bbb");
    }

    #[test]
    fn test_keyed_constant_reads_once() {
        let mut expressed = KeyedConstant::new();
        assert_eq!(expressed.observe("44109", 146394), 146394);
        assert_eq!(expressed.observe("44109", 146394), 146394);
        assert_eq!(expressed.get(&"44109"), Some(146394));
        assert_eq!(expressed.mismatches(), 0);

        expressed.observe("44109", 1);
        assert_eq!(expressed.get(&"44109"), Some(146394));
        assert_eq!(expressed.mismatches(), 1);
    }
}

// 🗄️ Merge Store - keyed JSON stores updated incrementally
// Keys in the batch overwrite; keys outside it are preserved.

use crate::artifact::{read_json, write_json_atomic};
use crate::reconciler::EntityKey;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Inserted,
    Replaced,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Inserted => "inserted",
            MergeAction::Replaced => "replaced",
        }
    }
}

/// One key whose stored content changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeChange {
    pub key: EntityKey,
    pub action: MergeAction,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Keys new to the store
    pub inserted: usize,

    /// Keys whose content changed
    pub replaced: usize,

    /// Keys re-written with identical content
    pub unchanged: usize,

    /// Stored keys absent from the batch
    pub preserved: usize,

    /// Stored elements dropped because their key did not validate
    pub dropped_invalid: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome<T> {
    pub merged: BTreeMap<EntityKey, T>,
    pub stats: MergeStats,
    pub changes: Vec<MergeChange>,
}

/// SHA-256 of the compact JSON serialization
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Directory of `{store_id}.json` files
#[derive(Debug, Clone)]
pub struct MergeStore {
    data_dir: PathBuf,
}

impl MergeStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        MergeStore {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, store_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", store_id))
    }

    /// Read a store without touching it. Absent file → empty map.
    pub fn load<T, K>(&self, store_id: &str, key_of: K) -> Result<BTreeMap<EntityKey, T>>
    where
        T: DeserializeOwned,
        K: Fn(&T) -> Option<EntityKey>,
    {
        Ok(self.load_indexed(store_id, &key_of)?.0)
    }

    fn load_indexed<T, K>(&self, store_id: &str, key_of: &K) -> Result<(BTreeMap<EntityKey, T>, usize)>
    where
        T: DeserializeOwned,
        K: Fn(&T) -> Option<EntityKey>,
    {
        let elements: Vec<T> = read_json(&self.path(store_id))?.unwrap_or_default();

        let mut indexed = BTreeMap::new();
        let mut dropped = 0;
        for element in elements {
            match key_of(&element) {
                Some(key) => {
                    indexed.insert(key, element);
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(store_id, dropped, "stored elements without a valid key were dropped");
        }

        Ok((indexed, dropped))
    }

    /// Merge `batch` into the store and persist the union.
    ///
    /// Re-applying the same batch is a no-op on content: every key lands in
    /// `unchanged` and no change is reported.
    pub fn merge_and_persist<T, K>(
        &self,
        store_id: &str,
        batch: BTreeMap<EntityKey, T>,
        key_of: K,
    ) -> Result<MergeOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        K: Fn(&T) -> Option<EntityKey>,
    {
        let (mut merged, dropped_invalid) = self.load_indexed(store_id, &key_of)?;
        let mut stats = MergeStats {
            dropped_invalid,
            ..Default::default()
        };
        let mut changes = Vec::new();

        stats.preserved = merged.keys().filter(|k| !batch.contains_key(*k)).count();

        for (key, entity) in batch {
            let new_hash = content_hash(&entity)?;
            let action = match merged.get(&key) {
                None => Some(MergeAction::Inserted),
                Some(old) if content_hash(old)? != new_hash => Some(MergeAction::Replaced),
                Some(_) => None,
            };

            match action {
                Some(MergeAction::Inserted) => stats.inserted += 1,
                Some(MergeAction::Replaced) => stats.replaced += 1,
                None => stats.unchanged += 1,
            }

            if let Some(action) = action {
                changes.push(MergeChange {
                    key: key.clone(),
                    action,
                    content_hash: new_hash,
                });
            }

            merged.insert(key, entity);
        }

        let elements: Vec<&T> = merged.values().collect();
        write_json_atomic(&self.path(store_id), &elements)?;

        info!(
            store_id,
            total = merged.len(),
            inserted = stats.inserted,
            replaced = stats.replaced,
            unchanged = stats.unchanged,
            preserved = stats.preserved,
            "store merged"
        );

        Ok(MergeOutcome {
            merged,
            stats,
            changes,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::NormalizedRow;
    use crate::reconciler::KeyKind;

    fn ips_row(uai: &str, ips: f64) -> NormalizedRow {
        NormalizedRow::new()
            .with("uai", uai)
            .with("rentree_scolaire", "2023-2024")
            .with("ips", ips)
    }

    fn batch(rows: Vec<NormalizedRow>) -> BTreeMap<EntityKey, NormalizedRow> {
        rows.into_iter()
            .map(|r| (EntityKey::uai(r.text("uai").unwrap()).unwrap(), r))
            .collect()
    }

    #[test]
    fn test_untouched_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = MergeStore::new(dir.path());
        let key_of = KeyKind::Uai.key_of("uai");

        store
            .merge_and_persist("ips", batch(vec![ips_row("0440021J", 101.0), ips_row("0490001K", 95.0)]), &key_of)
            .unwrap();

        let outcome = store
            .merge_and_persist("ips", batch(vec![ips_row("0440021J", 110.0)]), &key_of)
            .unwrap();

        assert_eq!(outcome.merged.len(), 2);
        assert_eq!(outcome.stats.replaced, 1);
        assert_eq!(outcome.stats.preserved, 1);

        let reloaded = store.load("ips", &key_of).unwrap();
        assert_eq!(reloaded[&EntityKey::uai("0440021J").unwrap()].number("ips"), Some(110.0));
        assert_eq!(reloaded[&EntityKey::uai("0490001K").unwrap()].number("ips"), Some(95.0));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MergeStore::new(dir.path());
        let key_of = KeyKind::Uai.key_of("uai");
        let rows = vec![ips_row("0440021J", 101.0), ips_row("0490001K", 95.0)];

        let first = store.merge_and_persist("ips", batch(rows.clone()), &key_of).unwrap();
        assert_eq!(first.stats.inserted, 2);
        let bytes_after_first = std::fs::read(store.path("ips")).unwrap();

        let second = store.merge_and_persist("ips", batch(rows), &key_of).unwrap();
        assert_eq!(second.stats.unchanged, 2);
        assert!(second.changes.is_empty());
        assert_eq!(std::fs::read(store.path("ips")).unwrap(), bytes_after_first);
    }

    #[test]
    fn test_invalid_stored_keys_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MergeStore::new(dir.path());
        std::fs::write(
            store.path("ips"),
            r#"[{"uai": "BROKEN"}, {"uai": "0440021J", "ips": 99.5}]"#,
        )
        .unwrap();

        let outcome = store
            .merge_and_persist("ips", BTreeMap::new(), KeyKind::Uai.key_of("uai"))
            .unwrap();
        assert_eq!(outcome.stats.dropped_invalid, 1);
        assert_eq!(outcome.stats.preserved, 1);
        assert_eq!(outcome.merged.len(), 1);
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MergeStore::new(dir.path());
        let loaded: BTreeMap<EntityKey, NormalizedRow> = store.load("nothing", KeyKind::Uai.key_of("uai")).unwrap();
        assert!(loaded.is_empty());
    }
}

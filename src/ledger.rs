// 📜 Provenance Ledger - append-only event log of store merges
// One event per inserted/replaced key, so a value in an artifact can be
// traced back to the run that wrote it.

use crate::merge_store::MergeChange;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub store_id: String,
    pub entity_key: String,

    /// "inserted" or "replaced"
    pub action: String,

    /// SHA-256 of the entry as written
    pub content_hash: String,
}

pub struct ProvenanceLedger {
    conn: Connection,
    run_id: String,
}

impl ProvenanceLedger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        setup_ledger(&conn)?;
        Ok(ProvenanceLedger {
            conn,
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Identifier shared by every event recorded through this handle
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one event per change; returns how many were written
    pub fn record_merge(&mut self, store_id: &str, changes: &[MergeChange]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for change in changes {
            tx.execute(
                "INSERT INTO merge_events (
                    event_id, run_id, timestamp, store_id, entity_key, action, content_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    self.run_id,
                    now,
                    store_id,
                    change.key.as_str(),
                    change.action.as_str(),
                    change.content_hash,
                ],
            )
            .with_context(|| format!("Failed to record {} for {}", change.action.as_str(), change.key))?;
        }

        tx.commit()?;
        debug!(store_id, events = changes.len(), "merge recorded in ledger");
        Ok(changes.len())
    }

    /// Events for one key, oldest first
    pub fn history(&self, store_id: &str, entity_key: &str) -> Result<Vec<MergeEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, run_id, timestamp, store_id, entity_key, action, content_hash
             FROM merge_events
             WHERE store_id = ?1 AND entity_key = ?2
             ORDER BY id ASC",
        )?;

        let events = stmt
            .query_map(params![store_id, entity_key], |row| {
                let timestamp: String = row.get(2)?;
                Ok(MergeEvent {
                    event_id: row.get(0)?,
                    run_id: row.get(1)?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                        })?
                        .with_timezone(&Utc),
                    store_id: row.get(3)?,
                    entity_key: row.get(4)?,
                    action: row.get(5)?,
                    content_hash: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM merge_events", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn setup_ledger(conn: &Connection) -> Result<()> {
    // WAL keeps the log readable while a run appends to it
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            store_id TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            action TEXT NOT NULL,
            content_hash TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_merge_events_entity ON merge_events(store_id, entity_key)",
        [],
    )?;

    Ok(())
}

// 🔗 Cross-Dataset Joiner - attach keyed side tables to base entities
// Generic over the composite; schools and communes each supply their tables.

use crate::reconciler::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Which dataset filled which part of a composite
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub section: String,
    pub dataset: String,
}

/// An entity that side tables attach to
pub trait Composite {
    /// Discriminant deciding which tables apply (school type, ...)
    type Tag: PartialEq + Copy;

    fn key(&self) -> &EntityKey;
    fn tag(&self) -> Self::Tag;
    fn record_source(&mut self, section: &str, dataset: &str);
}

/// One optional keyed dataset that may contribute to a composite
pub trait SideTable<C: Composite> {
    fn name(&self) -> &str;
    fn dataset(&self) -> &str;
    fn applies_to(&self, tag: C::Tag) -> bool;

    /// Attach this table's row for the composite's key; false when nothing
    /// was attached
    fn attach(&self, composite: &mut C) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applicability<T> {
    Always,
    Only(Vec<T>),
}

/// Side table backed by a keyed map and an attacher function.
///
/// The attacher returns false when the row exists but carries nothing
/// attachable (for instance no vintage).
pub struct KeyedTable<'a, C: Composite, R> {
    pub name: String,
    pub dataset: String,
    pub applicability: Applicability<<C as Composite>::Tag>,
    pub rows: Option<&'a BTreeMap<EntityKey, R>>,
    pub attacher: fn(&mut C, &R) -> bool,
}

impl<'a, C: Composite, R> KeyedTable<'a, C, R> {
    pub fn new(
        name: &str,
        dataset: &str,
        applicability: Applicability<C::Tag>,
        rows: Option<&'a BTreeMap<EntityKey, R>>,
        attacher: fn(&mut C, &R) -> bool,
    ) -> Self {
        KeyedTable {
            name: name.to_string(),
            dataset: dataset.to_string(),
            applicability,
            rows,
            attacher,
        }
    }
}

impl<'a, C: Composite, R> SideTable<C> for KeyedTable<'a, C, R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dataset(&self) -> &str {
        &self.dataset
    }

    fn applies_to(&self, tag: C::Tag) -> bool {
        match &self.applicability {
            Applicability::Always => true,
            Applicability::Only(tags) => tags.contains(&tag),
        }
    }

    fn attach(&self, composite: &mut C) -> bool {
        let Some(rows) = self.rows else {
            return false;
        };
        match rows.get(composite.key()) {
            Some(row) => (self.attacher)(composite, row),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub applicable: usize,
    pub attached: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    pub bases: usize,
    pub tables: BTreeMap<String, TableStats>,
}

impl JoinStats {
    /// Share of applicable bases that got the table, in percent
    pub fn coverage(&self, table: &str) -> Option<f64> {
        let stats = self.tables.get(table)?;
        if stats.applicable == 0 {
            return None;
        }
        Some(stats.attached as f64 / stats.applicable as f64 * 100.0)
    }
}

pub struct JoinReport<C> {
    pub entities: Vec<C>,
    pub stats: JoinStats,
}

pub struct Joiner<'a, C: Composite> {
    tables: Vec<Box<dyn SideTable<C> + 'a>>,
}

impl<'a, C: Composite> Joiner<'a, C> {
    pub fn new() -> Self {
        Joiner { tables: Vec::new() }
    }

    pub fn with_table(mut self, table: impl SideTable<C> + 'a) -> Self {
        self.tables.push(Box::new(table));
        self
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Attach every applicable table to every base, in table order
    pub fn join(&self, bases: Vec<C>) -> JoinReport<C> {
        let mut stats = JoinStats {
            bases: bases.len(),
            tables: self
                .tables
                .iter()
                .map(|t| (t.name().to_string(), TableStats::default()))
                .collect(),
        };

        let mut entities = bases;
        for entity in entities.iter_mut() {
            for table in &self.tables {
                if !table.applies_to(entity.tag()) {
                    continue;
                }
                let entry = stats.tables.entry(table.name().to_string()).or_default();
                entry.applicable += 1;
                if table.attach(entity) {
                    entity.record_source(table.name(), table.dataset());
                    entry.attached += 1;
                }
            }
        }

        for (name, table) in &stats.tables {
            info!(table = %name, applicable = table.applicable, attached = table.attached, "side table joined");
        }

        JoinReport { entities, stats }
    }
}

impl<'a, C: Composite> Default for Joiner<'a, C> {
    fn default() -> Self {
        Self::new()
    }
}

// 🏛️ Mayors - current mayor per commune from the elected-officials register

use super::sources::{normalize_department, MayorSource};
use super::Mayor;
use crate::normalizer::NormalizedRow;
use crate::reconciler::{reconcile, EntityKey, FirstWins};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Keep rows whose function is exactly the configured one (never deputies)
/// inside the given departments, one mayor per commune
pub fn extract_mayors(
    rows: Vec<NormalizedRow>,
    source: &MayorSource,
    departments: &BTreeSet<String>,
) -> BTreeMap<EntityKey, Mayor> {
    let total = rows.len();

    let mayors: Vec<(EntityKey, Mayor)> = rows
        .into_iter()
        .filter(|row| row.text("fonction") == Some(source.function.as_str()))
        .filter(|row| {
            row.text("code_departement")
                .map(|d| departments.contains(&normalize_department(d)))
                .unwrap_or(false)
        })
        .filter_map(|row| {
            let key = EntityKey::insee(row.text("code_commune")?)?;
            Some((
                key,
                Mayor {
                    first_name: row.text("prenom").unwrap_or_default().to_string(),
                    last_name: row.text("nom").unwrap_or_default().to_string(),
                    party: None,
                    year: source.year.clone(),
                },
            ))
        })
        .collect();

    let reconciled = reconcile(mayors, |(key, _)| Some(key.clone()), &FirstWins);
    info!(
        rows = total,
        mayors = reconciled.entities.len(),
        duplicates = reconciled.stats.conflicts,
        "mayors extracted"
    );

    reconciled
        .entities
        .into_iter()
        .map(|(key, (_, mayor))| (key, mayor))
        .collect()
}

// 🏘️ Commune Entity - political composite keyed by INSEE code
// Base set is every commune seen by any political table or the school mapping.

use crate::election::{CommuneRecord, ElectionResult, Mayor, MunicipalResult};
use crate::joiner::{Applicability, Composite, JoinReport, Joiner, KeyedTable, SourceRef};
use crate::reconciler::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

pub const MAYORS_DATASET: &str = "repertoire-national-des-elus";
pub const MUNICIPAL_DATASET: &str = "municipales-2020";
pub const PRESIDENTIAL_DATASET: &str = "presidentielle-2022";
pub const LEGISLATIVE_DATASET: &str = "legislatives-2024";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commune {
    pub insee_code: EntityKey,
    pub commune_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mayor: Option<Mayor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub municipal: Option<MunicipalResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presidential: Option<ElectionResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legislative: Option<ElectionResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
}

impl Commune {
    pub fn new(insee_code: EntityKey, commune_name: String) -> Self {
        Commune {
            insee_code,
            commune_name,
            mayor: None,
            municipal: None,
            presidential: None,
            legislative: None,
            sources: Vec::new(),
        }
    }
}

impl Composite for Commune {
    // every table applies to every commune
    type Tag = ();

    fn key(&self) -> &EntityKey {
        &self.insee_code
    }

    fn tag(&self) {}

    fn record_source(&mut self, section: &str, dataset: &str) {
        self.sources.push(SourceRef {
            section: section.to_string(),
            dataset: dataset.to_string(),
        });
    }
}

pub fn attach_mayor(commune: &mut Commune, record: &CommuneRecord<Mayor>) -> bool {
    if record.data.year.trim().is_empty() {
        return false;
    }
    commune.mayor = Some(record.data.clone());
    true
}

pub fn attach_municipal(commune: &mut Commune, record: &CommuneRecord<MunicipalResult>) -> bool {
    if record.data.year.trim().is_empty() {
        return false;
    }
    commune.municipal = Some(record.data.clone());
    true
}

fn has_rounds(result: &ElectionResult) -> bool {
    !result.year.trim().is_empty() && !(result.round_1.is_empty() && result.round_2.is_empty())
}

pub fn attach_presidential(commune: &mut Commune, record: &CommuneRecord<ElectionResult>) -> bool {
    if !has_rounds(&record.data) {
        return false;
    }
    commune.presidential = Some(record.data.clone());
    true
}

pub fn attach_legislative(commune: &mut Commune, record: &CommuneRecord<ElectionResult>) -> bool {
    if !has_rounds(&record.data) {
        return false;
    }
    commune.legislative = Some(record.data.clone());
    true
}

/// Persisted political stores, each optional
#[derive(Default)]
pub struct CommuneTables<'a> {
    pub mayors: Option<&'a BTreeMap<EntityKey, CommuneRecord<Mayor>>>,
    pub municipal: Option<&'a BTreeMap<EntityKey, CommuneRecord<MunicipalResult>>>,
    pub presidential: Option<&'a BTreeMap<EntityKey, CommuneRecord<ElectionResult>>>,
    pub legislative: Option<&'a BTreeMap<EntityKey, CommuneRecord<ElectionResult>>>,
}

impl<'a> CommuneTables<'a> {
    pub fn joiner(&self) -> Joiner<'a, Commune> {
        Joiner::new()
            .with_table(KeyedTable::new("mayor", MAYORS_DATASET, Applicability::Always, self.mayors, attach_mayor))
            .with_table(KeyedTable::new(
                "municipal",
                MUNICIPAL_DATASET,
                Applicability::Always,
                self.municipal,
                attach_municipal,
            ))
            .with_table(KeyedTable::new(
                "presidential",
                PRESIDENTIAL_DATASET,
                Applicability::Always,
                self.presidential,
                attach_presidential,
            ))
            .with_table(KeyedTable::new(
                "legislative",
                LEGISLATIVE_DATASET,
                Applicability::Always,
                self.legislative,
                attach_legislative,
            ))
    }

    fn keys(&self) -> BTreeSet<EntityKey> {
        let mut keys = BTreeSet::new();
        if let Some(t) = self.mayors {
            keys.extend(t.keys().cloned());
        }
        if let Some(t) = self.municipal {
            keys.extend(t.keys().cloned());
        }
        if let Some(t) = self.presidential {
            keys.extend(t.keys().cloned());
        }
        if let Some(t) = self.legislative {
            keys.extend(t.keys().cloned());
        }
        keys
    }

    /// Label printed in any political export for this commune
    fn record_name(&self, key: &EntityKey) -> Option<String> {
        let mayor = self.mayors.and_then(|t| t.get(key)).and_then(|r| r.commune_name.clone());
        mayor
            .or_else(|| self.municipal.and_then(|t| t.get(key)).and_then(|r| r.commune_name.clone()))
            .or_else(|| self.presidential.and_then(|t| t.get(key)).and_then(|r| r.commune_name.clone()))
            .or_else(|| self.legislative.and_then(|t| t.get(key)).and_then(|r| r.commune_name.clone()))
    }
}

/// Join every political table onto the commune base set.
///
/// `resolved_names` comes from the geo resolver and wins over export labels.
pub fn assemble_communes(tables: &CommuneTables<'_>, resolved_names: &BTreeMap<EntityKey, String>) -> JoinReport<Commune> {
    let mut keys = tables.keys();
    keys.extend(resolved_names.keys().cloned());

    let bases: Vec<Commune> = keys
        .into_iter()
        .map(|key| {
            let name = resolved_names
                .get(&key)
                .cloned()
                .or_else(|| tables.record_name(&key))
                .unwrap_or_else(|| format!("Commune {}", key));
            Commune::new(key, name)
        })
        .collect();

    info!(communes = bases.len(), "commune bases built");
    tables.joiner().join(bases)
}

/// Artifact shape: object keyed by INSEE code
pub fn index_by_code(communes: Vec<Commune>) -> BTreeMap<String, Commune> {
    communes.into_iter().map(|c| (c.insee_code.to_string(), c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::CandidateResult;

    fn key(code: &str) -> EntityKey {
        EntityKey::insee(code).unwrap()
    }

    fn record<T>(code: &str, name: Option<&str>, data: T) -> (EntityKey, CommuneRecord<T>) {
        (
            key(code),
            CommuneRecord {
                insee_code: code.to_string(),
                commune_name: name.map(|n| n.to_string()),
                data,
            },
        )
    }

    fn mayor(last: &str) -> Mayor {
        Mayor {
            first_name: "Prénom".to_string(),
            last_name: last.to_string(),
            party: None,
            year: "2024".to_string(),
        }
    }

    fn presidential() -> ElectionResult {
        ElectionResult {
            year: "2022".to_string(),
            round_1: vec![CandidateResult {
                candidate: "Emmanuel MACRON".to_string(),
                party: None,
                percentage: 31.2,
                votes: 1000,
            }],
            round_2: Vec::new(),
        }
    }

    #[test]
    fn test_base_set_is_union_of_tables() {
        let mayors: BTreeMap<_, _> = vec![record("44109", Some("Nantes"), mayor("Rolland"))].into_iter().collect();
        let pres: BTreeMap<_, _> = vec![record("85191", None, presidential())].into_iter().collect();
        let mut resolved = BTreeMap::new();
        resolved.insert(key("49007"), "Angers".to_string());

        let tables = CommuneTables {
            mayors: Some(&mayors),
            presidential: Some(&pres),
            ..Default::default()
        };

        let report = assemble_communes(&tables, &resolved);
        let codes: Vec<&str> = report.entities.iter().map(|c| c.insee_code.as_str()).collect();
        assert_eq!(codes, vec!["44109", "49007", "85191"]);

        let nantes = &report.entities[0];
        assert_eq!(nantes.commune_name, "Nantes");
        assert_eq!(nantes.mayor.as_ref().unwrap().last_name, "Rolland");
        assert_eq!(nantes.sources[0].section, "mayor");

        assert_eq!(report.entities[1].commune_name, "Angers");
        assert!(report.entities[1].sources.is_empty());
        assert_eq!(report.entities[2].commune_name, "Commune 85191");
    }

    #[test]
    fn test_resolved_name_wins() {
        let mayors: BTreeMap<_, _> = vec![record("44109", Some("NANTES"), mayor("Rolland"))].into_iter().collect();
        let mut resolved = BTreeMap::new();
        resolved.insert(key("44109"), "Nantes".to_string());

        let tables = CommuneTables {
            mayors: Some(&mayors),
            ..Default::default()
        };
        let report = assemble_communes(&tables, &resolved);
        assert_eq!(report.entities[0].commune_name, "Nantes");
    }

    #[test]
    fn test_empty_election_not_attached() {
        let empty = ElectionResult {
            year: "2022".to_string(),
            ..Default::default()
        };
        let pres: BTreeMap<_, _> = vec![record("44109", None, empty)].into_iter().collect();
        let tables = CommuneTables {
            presidential: Some(&pres),
            ..Default::default()
        };
        let report = assemble_communes(&tables, &BTreeMap::new());
        assert!(report.entities[0].presidential.is_none());
        assert_eq!(report.stats.tables["presidential"].attached, 0);
    }

    #[test]
    fn test_index_by_code() {
        let communes = vec![Commune::new(key("85191"), "La Roche-sur-Yon".to_string())];
        let indexed = index_by_code(communes);
        assert_eq!(indexed["85191"].insee_code.as_str(), "85191");
    }
}

// 🗳️ Election Sub-Joiner - per-commune political tables
// Sources are tallied one by one, then folded into one table per election.

pub mod mayors;
pub mod parties;
pub mod sources;
pub mod tally;

pub use mayors::extract_mayors;
pub use parties::PartyLabels;
pub use sources::{
    default_sources, CommuneCodeConvention, ElectionColumns, ElectionKind, ElectionSource, MayorSource, RowLayout,
    RunoffShape,
};
pub use tally::{percentage, round1, CandidateResult, CommuneRound, ElectionTally, Tally, TallyStats};

use crate::reconciler::{reconcile, Choice, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// SUB-RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mayor {
    pub first_name: String,
    pub last_name: String,

    /// Filled from the commune's municipal winner
    pub party: Option<String>,

    pub year: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MunicipalResult {
    pub year: String,
    pub round: u8,
    pub winning_list: String,

    /// Nuance code as published
    pub party: Option<String>,

    pub party_label: Option<String>,
    pub percentage: f64,
}

/// Presidential or legislative results for one commune
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionResult {
    pub year: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_1: Vec<CandidateResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_2: Vec<CandidateResult>,
}

/// Stored element of a political store: a sub-record with its commune key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommuneRecord<T> {
    pub insee_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commune_name: Option<String>,

    pub data: T,
}

impl<T> CommuneRecord<T> {
    pub fn key(&self) -> Option<EntityKey> {
        EntityKey::insee(&self.insee_code)
    }
}

/// Wrap a keyed table for persistence
pub fn to_records<T>(
    table: BTreeMap<EntityKey, T>,
    names: &BTreeMap<EntityKey, String>,
) -> BTreeMap<EntityKey, CommuneRecord<T>> {
    table
        .into_iter()
        .map(|(key, data)| {
            let record = CommuneRecord {
                insee_code: key.to_string(),
                commune_name: names.get(&key).cloned(),
                data,
            };
            (key, record)
        })
        .collect()
}

// ============================================================================
// MUNICIPAL PRECEDENCE
// ============================================================================

/// A strictly higher round wins; in the same round the higher percentage
/// wins and ties keep the stored result.
pub fn municipal_precedence(existing: &MunicipalResult, candidate: &MunicipalResult) -> Choice {
    if candidate.round > existing.round {
        return Choice::TakeCandidate;
    }
    if candidate.round < existing.round {
        return Choice::KeepExisting;
    }
    if candidate.percentage > existing.percentage {
        Choice::TakeCandidate
    } else {
        Choice::KeepExisting
    }
}

/// Winner of one municipal tally per commune
pub fn municipal_winners(source: &ElectionSource, tally: &Tally, parties: &PartyLabels) -> Vec<(EntityKey, MunicipalResult)> {
    tally
        .communes
        .iter()
        .filter_map(|(key, round)| {
            let winner = round.candidates.first()?;
            Some((
                key.clone(),
                MunicipalResult {
                    year: source.year.clone(),
                    round: source.round,
                    winning_list: winner.candidate.clone(),
                    party: winner.party.clone(),
                    party_label: winner.party.as_deref().map(|code| parties.label(code).to_string()),
                    percentage: winner.percentage,
                },
            ))
        })
        .collect()
}

// ============================================================================
// POLITICAL TABLES
// ============================================================================

/// All political tables keyed by INSEE code
#[derive(Debug, Clone, Default)]
pub struct PoliticalTables {
    pub mayors: BTreeMap<EntityKey, Mayor>,
    pub municipal: BTreeMap<EntityKey, MunicipalResult>,
    pub presidential: BTreeMap<EntityKey, ElectionResult>,
    pub legislative: BTreeMap<EntityKey, ElectionResult>,

    /// Commune label as printed in the exports
    pub commune_names: BTreeMap<EntityKey, String>,
}

impl PoliticalTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tallied source into the tables
    pub fn add_tally(&mut self, source: &ElectionSource, tally: Tally, parties: &PartyLabels) {
        for (key, round) in &tally.communes {
            if let Some(name) = &round.commune_name {
                self.commune_names.entry(key.clone()).or_insert_with(|| name.clone());
            }
        }

        match source.kind {
            ElectionKind::Municipal => {
                let candidates = municipal_winners(source, &tally, parties);
                let existing = std::mem::take(&mut self.municipal);
                let rows = existing.into_iter().chain(candidates);
                let precedence = |a: &(EntityKey, MunicipalResult), b: &(EntityKey, MunicipalResult)| {
                    municipal_precedence(&a.1, &b.1)
                };
                self.municipal = reconcile(rows, |(key, _)| Some(key.clone()), &precedence)
                    .entities
                    .into_iter()
                    .map(|(key, (_, result))| (key, result))
                    .collect();
            }
            ElectionKind::Presidential | ElectionKind::Legislative => {
                let table = if source.kind == ElectionKind::Presidential {
                    &mut self.presidential
                } else {
                    &mut self.legislative
                };
                for (key, mut round) in tally.communes {
                    for candidate in round.candidates.iter_mut() {
                        if let Some(code) = candidate.party.take() {
                            candidate.party = Some(parties.label(&code).to_string());
                        }
                    }
                    let entry = table.entry(key).or_insert_with(|| ElectionResult {
                        year: source.year.clone(),
                        ..Default::default()
                    });
                    if source.is_runoff() {
                        entry.round_2 = round.candidates;
                    } else {
                        entry.round_1 = round.candidates;
                    }
                }
            }
        }
    }

    /// Mayor's party comes from the municipal winner
    pub fn fill_mayor_parties(&mut self) {
        for (key, mayor) in self.mayors.iter_mut() {
            if let Some(result) = self.municipal.get(key) {
                mayor.party = result.party_label.clone().or_else(|| result.party.clone());
            }
        }
    }
}

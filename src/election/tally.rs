// 🧮 Election Tally - votes per candidate per commune, percentages, top-N
// Expressed votes are a per-(commune, sub-unit) constant, read once.

use super::sources::{ElectionColumns, ElectionSource, RowLayout, RunoffShape};
use crate::normalizer::NormalizedRow;
use crate::reconciler::{EntityKey, KeyedConstant};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Round 1 keeps this many candidates, by percentage
pub const ROUND_ONE_TOP: usize = 4;

/// Runoffs keep this many, by votes
pub const RUNOFF_TOP: usize = 2;

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// round1(votes / expressed × 100); `None` when expressed is not positive
pub fn percentage(votes: i64, expressed: i64) -> Option<f64> {
    if expressed <= 0 {
        return None;
    }
    Some(round1(votes as f64 / expressed as f64 * 100.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,

    pub percentage: f64,

    #[serde(default)]
    pub votes: i64,
}

/// One commune's outcome for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommuneRound {
    pub commune_name: Option<String>,
    pub expressed: i64,
    pub candidates: Vec<CandidateResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TallyStats {
    pub rows: usize,
    pub outside_regions: usize,
    pub without_commune_key: usize,
    pub without_expressed: usize,
    pub communes: usize,
    pub denominator_mismatches: usize,
}

#[derive(Debug, Clone)]
pub struct Tally {
    pub communes: BTreeMap<EntityKey, CommuneRound>,
    pub stats: TallyStats,
}

/// One candidate's cells as read from a row
#[derive(Debug, Clone, PartialEq)]
struct CandidateCells {
    name: String,
    party: Option<String>,
    votes: i64,
}

#[derive(Debug, Default)]
struct CommuneAccumulator {
    name: Option<String>,
    votes: BTreeMap<String, (Option<String>, i64)>,
}

pub struct ElectionTally<'a> {
    source: &'a ElectionSource,
    departments: &'a BTreeSet<String>,
    max_candidate_slots: usize,
}

impl<'a> ElectionTally<'a> {
    pub fn new(source: &'a ElectionSource, departments: &'a BTreeSet<String>, max_candidate_slots: usize) -> Self {
        ElectionTally {
            source,
            departments,
            max_candidate_slots,
        }
    }

    pub fn tally(&self, rows: &[NormalizedRow]) -> Tally {
        let columns = &self.source.columns;
        let mut stats = TallyStats::default();
        let mut accumulators: BTreeMap<EntityKey, CommuneAccumulator> = BTreeMap::new();
        let mut expressed: KeyedConstant<(EntityKey, String)> = KeyedConstant::new();

        for row in rows {
            stats.rows += 1;

            match self.source.department_of(row) {
                Some(dept) if self.departments.contains(&dept) => {}
                _ => {
                    stats.outside_regions += 1;
                    continue;
                }
            }

            let key = match self.source.commune_key(row) {
                Some(k) => k,
                None => {
                    stats.without_commune_key += 1;
                    continue;
                }
            };

            let Some(row_expressed) = row.integer(&columns.expressed) else {
                stats.without_expressed += 1;
                continue;
            };

            let subkey = columns
                .subkey
                .as_deref()
                .and_then(|field| row.year(field))
                .unwrap_or_default();
            expressed.observe((key.clone(), subkey), row_expressed);

            let acc = accumulators.entry(key).or_default();
            if acc.name.is_none() {
                acc.name = row.text(&columns.commune_name).map(|s| s.to_string());
            }

            for cells in self.candidates_of(row) {
                let entry = acc.votes.entry(cells.name).or_insert((cells.party, 0));
                entry.1 += cells.votes;
            }
        }

        // expressed per commune = sum over distinct sub-units
        let mut expressed_by_commune: BTreeMap<EntityKey, i64> = BTreeMap::new();
        for ((key, _), value) in expressed.iter() {
            *expressed_by_commune.entry(key.clone()).or_insert(0) += value;
        }
        stats.denominator_mismatches = expressed.mismatches();

        let mut communes = BTreeMap::new();
        for (key, acc) in accumulators {
            let total = expressed_by_commune.get(&key).copied().unwrap_or(0);
            let mut candidates: Vec<CandidateResult> = acc
                .votes
                .into_iter()
                .filter_map(|(candidate, (party, votes))| {
                    Some(CandidateResult {
                        candidate,
                        party,
                        percentage: percentage(votes, total)?,
                        votes,
                    })
                })
                .collect();

            if candidates.is_empty() {
                continue;
            }

            if self.source.is_runoff() {
                if let RunoffShape::LeaderOnly { trailing_candidate } = &self.source.runoff {
                    complete_runoff(&mut candidates, total, trailing_candidate);
                }
                rank_runoff(&mut candidates);
            } else {
                rank_first_round(&mut candidates);
            }

            communes.insert(
                key,
                CommuneRound {
                    commune_name: acc.name,
                    expressed: total,
                    candidates,
                },
            );
        }

        stats.communes = communes.len();
        if stats.denominator_mismatches > 0 {
            debug!(source = %self.source.id, mismatches = stats.denominator_mismatches, "expressed votes differ within a unit");
        }
        info!(
            source = %self.source.id,
            rows = stats.rows,
            communes = stats.communes,
            outside_regions = stats.outside_regions,
            "election tallied"
        );

        Tally { communes, stats }
    }

    fn candidates_of(&self, row: &NormalizedRow) -> Vec<CandidateCells> {
        let columns = &self.source.columns;
        match self.source.layout {
            RowLayout::Long => read_candidate(row, columns, None).into_iter().collect(),
            RowLayout::Wide => {
                let mut found = Vec::with_capacity(self.max_candidate_slots);
                for n in 1..=self.max_candidate_slots {
                    match read_candidate(row, columns, Some(n)) {
                        Some(cells) => found.push(cells),
                        None => break,
                    }
                }
                found
            }
        }
    }
}

fn read_candidate(row: &NormalizedRow, columns: &ElectionColumns, slot: Option<usize>) -> Option<CandidateCells> {
    let header = |template: &str| match slot {
        Some(n) => ElectionColumns::slot(template, n),
        None => template.to_string(),
    };

    let votes = row.integer(&header(&columns.votes))?;
    let last = row.text(&header(&columns.last_name));
    let list = columns
        .list_label
        .as_deref()
        .and_then(|field| row.text(&header(field)));
    let party = row.text(&header(&columns.party)).map(|s| s.to_string());

    let name = match (list, last) {
        (Some(list), _) => list.to_string(),
        (None, Some(last)) => match row.text(&header(&columns.first_name)) {
            Some(first) => format!("{} {}", first, last),
            None => last.to_string(),
        },
        // a wide slot without a name ends the candidate groups
        (None, None) if slot.is_some() => return None,
        (None, None) => party.clone()?,
    };

    Some(CandidateCells { name, party, votes })
}

fn by_name(a: &CandidateResult, b: &CandidateResult) -> Ordering {
    a.candidate.cmp(&b.candidate)
}

/// Top 4 by percentage, descending; ties by name
pub fn rank_first_round(candidates: &mut Vec<CandidateResult>) {
    candidates.sort_by(|a, b| {
        b.percentage
            .partial_cmp(&a.percentage)
            .unwrap_or(Ordering::Equal)
            .then_with(|| by_name(a, b))
    });
    candidates.truncate(ROUND_ONE_TOP);
}

/// Top 2 by votes, descending; ties by name
pub fn rank_runoff(candidates: &mut Vec<CandidateResult>) {
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| by_name(a, b)));
    candidates.truncate(RUNOFF_TOP);
}

/// Infer the trailing candidate as expressed − leader when only the leader
/// has a vote count
pub fn complete_runoff(candidates: &mut Vec<CandidateResult>, expressed: i64, trailing_candidate: &str) {
    if candidates.len() != 1 || expressed <= 0 {
        return;
    }
    let trailing_votes = (expressed - candidates[0].votes).max(0);
    if let Some(pct) = percentage(trailing_votes, expressed) {
        candidates.push(CandidateResult {
            candidate: trailing_candidate.to_string(),
            party: None,
            percentage: pct,
            votes: trailing_votes,
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

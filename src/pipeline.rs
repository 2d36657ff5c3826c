// 🚂 Batch Pipeline - fetch, reconcile, merge, join
// Steps run one after another; each fetch step merges into its own store.

use crate::artifact::{read_json, write_json_atomic};
use crate::config::PipelineConfig;
use crate::datasets::{self, DatasetSpec, LanguageRecord};
use crate::election::{
    extract_mayors, to_records, CommuneRecord, ElectionKind, ElectionResult, ElectionTally, Mayor, MunicipalResult,
    PartyLabels, PoliticalTables,
};
use crate::entities::commune::{assemble_communes, index_by_code, CommuneTables};
use crate::entities::school::{assemble_schools, LanguageOffering, SchoolTables};
use crate::fetcher::{PaginatedFetcher, Transport};
use crate::insee::{location_key, names_by_code, GeoResolver, InseeMapping};
use crate::joiner::JoinStats;
use crate::ledger::ProvenanceLedger;
use crate::merge_store::{MergeStats, MergeStore};
use crate::normalizer::{NormalizedRow, RowSchema};
use crate::reconciler::EntityKey;
use crate::rules::SchoolRules;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

pub const SCHOOLS_ARTIFACT: &str = "schools.json";
pub const COMMUNES_ARTIFACT: &str = "communes.json";
pub const INSEE_MAPPING_ARTIFACT: &str = "insee_mapping.json";

pub const MAYORS_STORE: &str = "mayors";
pub const MUNICIPAL_STORE: &str = "municipal";
pub const PRESIDENTIAL_STORE: &str = "presidential";
pub const LEGISLATIVE_STORE: &str = "legislative";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Education,
    Enrollment,
    Languages,
    Political,
    Schools,
    Communes,
    All,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Education => "education",
            Step::Enrollment => "enrollment",
            Step::Languages => "languages",
            Step::Political => "political",
            Step::Schools => "schools",
            Step::Communes => "communes",
            Step::All => "all",
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StoreReport {
    pub store_id: String,

    /// Rows received from upstream
    pub fetched: usize,

    /// Entities left after reconciliation
    pub reconciled: usize,

    /// Every request of every region succeeded
    pub complete: bool,

    pub merge: MergeStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactReport {
    pub path: PathBuf,
    pub entities: usize,
    pub join: JoinStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub stores: Vec<StoreReport>,
    pub artifacts: Vec<ArtifactReport>,
    pub ledger_events: usize,
}

impl RunSummary {
    /// Stores whose fetch ended early
    pub fn incomplete(&self) -> Vec<&str> {
        self.stores
            .iter()
            .filter(|s| !s.complete)
            .map(|s| s.store_id.as_str())
            .collect()
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<'t> {
    config: PipelineConfig,
    rules: SchoolRules,
    store: MergeStore,
    ledger: Option<ProvenanceLedger>,
    education: &'t dyn Transport,
    geo: &'t dyn Transport,
}

impl<'t> Pipeline<'t> {
    pub fn new(config: PipelineConfig, education: &'t dyn Transport, geo: &'t dyn Transport) -> Result<Self> {
        let ledger = match config.ledger_file() {
            Some(path) => Some(ProvenanceLedger::open(&path)?),
            None => None,
        };
        Ok(Pipeline {
            rules: config.school_rules(),
            store: MergeStore::new(config.data_dir.clone()),
            config,
            ledger,
            education,
            geo,
        })
    }

    pub fn ledger(&self) -> Option<&ProvenanceLedger> {
        self.ledger.as_ref()
    }

    pub fn run(&mut self, step: Step) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let steps = match step {
            Step::All => vec![
                Step::Education,
                Step::Enrollment,
                Step::Languages,
                Step::Political,
                Step::Schools,
                Step::Communes,
            ],
            other => vec![other],
        };

        for step in steps {
            info!(step = step.as_str(), "step started");
            match step {
                Step::Education => self.run_catalog(&datasets::education_datasets(), &mut summary)?,
                Step::Enrollment => self.run_catalog(&datasets::enrollment_datasets(), &mut summary)?,
                Step::Languages => self.run_languages(&mut summary)?,
                Step::Political => self.run_political(&mut summary)?,
                Step::Schools => self.run_schools(&mut summary)?,
                Step::Communes => self.run_communes(&mut summary)?,
                Step::All => {}
            }
        }

        Ok(summary)
    }

    /// Merge a batch and record its changes in the ledger
    fn persist<T, K>(&mut self, store_id: &str, batch: BTreeMap<EntityKey, T>, key_of: K, summary: &mut RunSummary) -> Result<MergeStats>
    where
        T: Serialize + DeserializeOwned,
        K: Fn(&T) -> Option<EntityKey>,
    {
        let outcome = self
            .store
            .merge_and_persist(store_id, batch, key_of)
            .with_context(|| format!("Failed to update store {}", store_id))?;

        if let Some(ledger) = self.ledger.as_mut() {
            summary.ledger_events += ledger.record_merge(store_id, &outcome.changes)?;
        }
        Ok(outcome.stats)
    }

    /// All regions of one dataset, normalized with the dataset's schema
    fn fetch_rows(&self, dataset_id: &str, filters: &[String], schema: &RowSchema) -> (Vec<NormalizedRow>, usize, bool) {
        let mut fetcher = PaginatedFetcher::new(self.education, &self.config.education_api);
        let mut rows = Vec::new();
        let mut fetched = 0;
        let mut complete = true;

        for filter in filters {
            let outcome = fetcher.fetch(dataset_id, Some(filter));
            fetched += outcome.rows.len();
            complete &= outcome.complete;
            rows.extend(schema.normalize_all(&outcome.rows));
        }

        if rows.len() < fetched {
            warn!(dataset = dataset_id, fetched, normalized = rows.len(), "rows without the expected envelope dropped");
        }
        (rows, fetched, complete)
    }

    fn run_catalog(&mut self, catalog: &[DatasetSpec], summary: &mut RunSummary) -> Result<()> {
        for spec in catalog {
            let filters = spec.filters(&self.config.regions);
            let (rows, fetched, complete) = self.fetch_rows(spec.id, &filters, &spec.schema);

            let reconciled = spec.reconcile(rows, &self.rules, &self.config.satellite_keywords);
            let kept = reconciled.entities.len();
            info!(
                dataset = spec.id,
                seen = reconciled.stats.seen,
                kept,
                without_key = reconciled.stats.dropped_without_key,
                "dataset reconciled"
            );

            let merge = self.persist(spec.store_id, reconciled.entities, spec.key_of(), summary)?;
            summary.stores.push(StoreReport {
                store_id: spec.store_id.to_string(),
                fetched,
                reconciled: kept,
                complete,
                merge,
            });
        }
        Ok(())
    }

    fn run_languages(&mut self, summary: &mut RunSummary) -> Result<()> {
        let filter = datasets::languages_filter();
        let filters: Vec<String> = self.config.regions.iter().map(|r| filter.clause(r)).collect();
        let schema = RowSchema::record_fields();
        let (rows, fetched, complete) = self.fetch_rows(datasets::LANGUAGES, &filters, &schema);

        let offerings = datasets::aggregate_languages(&rows, &self.config.languages_vintage);
        let kept = offerings.len();
        let merge = self.persist(datasets::LANGUAGES_STORE, offerings, |r: &LanguageRecord| r.key(), summary)?;

        summary.stores.push(StoreReport {
            store_id: datasets::LANGUAGES_STORE.to_string(),
            fetched,
            reconciled: kept,
            complete,
            merge,
        });
        Ok(())
    }

    fn run_political(&mut self, summary: &mut RunSummary) -> Result<()> {
        let departments = self.config.department_codes();
        let parties = PartyLabels::new(&self.config.party_labels);
        let mut fetcher = PaginatedFetcher::new(self.education, &self.config.education_api);
        let mut tables = PoliticalTables::new();
        let mut failed: BTreeSet<ElectionKind> = BTreeSet::new();
        let mut fetched: BTreeMap<&'static str, usize> = BTreeMap::new();

        let mayor_source = self.config.elections.mayors.clone();
        let mayors_ok = match fetcher.download(&mayor_source.url).bytes {
            Some(bytes) => {
                let rows = mayor_source.format.read_rows(&bytes).context("Failed to read the mayors export")?;
                *fetched.entry(MAYORS_STORE).or_default() += rows.len();
                tables.mayors = extract_mayors(rows, &mayor_source, &departments);
                true
            }
            None => false,
        };

        for source in &self.config.elections.sources {
            let Some(bytes) = fetcher.download(&source.url).bytes else {
                failed.insert(source.kind);
                continue;
            };
            let rows = source
                .format
                .read_rows(&bytes)
                .with_context(|| format!("Failed to read election export {}", source.id))?;

            let tally = ElectionTally::new(source, &departments, self.config.elections.max_candidate_slots).tally(&rows);
            info!(
                source = %source.id,
                rows = tally.stats.rows,
                communes = tally.stats.communes,
                outside_regions = tally.stats.outside_regions,
                denominator_mismatches = tally.stats.denominator_mismatches,
                "election tallied"
            );
            *fetched.entry(store_for(source.kind)).or_default() += rows.len();
            tables.add_tally(source, tally, &parties);
        }

        // a failed municipal export must not leave mayors without parties
        if failed.contains(&ElectionKind::Municipal) {
            let stored: BTreeMap<EntityKey, CommuneRecord<MunicipalResult>> =
                self.store.load(MUNICIPAL_STORE, |r: &CommuneRecord<MunicipalResult>| r.key())?;
            for (key, record) in stored {
                tables.municipal.entry(key).or_insert(record.data);
            }
        }
        tables.fill_mayor_parties();

        let names = tables.commune_names.clone();
        let count_of = |store_id: &str| fetched.get(store_id).copied().unwrap_or(0);

        if mayors_ok {
            let fetched = count_of(MAYORS_STORE);
            self.persist_political(MAYORS_STORE, std::mem::take(&mut tables.mayors), &names, fetched, summary)?;
        } else {
            warn!(store = MAYORS_STORE, "export unavailable, store left untouched");
        }

        let elections = [
            (ElectionKind::Municipal, MUNICIPAL_STORE),
            (ElectionKind::Presidential, PRESIDENTIAL_STORE),
            (ElectionKind::Legislative, LEGISLATIVE_STORE),
        ];
        for (kind, store_id) in elections {
            // a partial set of rounds would overwrite complete stored results
            if failed.contains(&kind) {
                warn!(store = store_id, "export unavailable, store left untouched");
                continue;
            }
            let fetched = count_of(store_id);
            match kind {
                ElectionKind::Municipal => {
                    let table = std::mem::take(&mut tables.municipal);
                    self.persist_political(store_id, table, &names, fetched, summary)?
                }
                ElectionKind::Presidential => {
                    let table = std::mem::take(&mut tables.presidential);
                    self.persist_political(store_id, table, &names, fetched, summary)?
                }
                ElectionKind::Legislative => {
                    let table = std::mem::take(&mut tables.legislative);
                    self.persist_political(store_id, table, &names, fetched, summary)?
                }
            }
        }

        Ok(())
    }

    fn persist_political<T>(
        &mut self,
        store_id: &str,
        table: BTreeMap<EntityKey, T>,
        names: &BTreeMap<EntityKey, String>,
        fetched: usize,
        summary: &mut RunSummary,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let reconciled = table.len();
        let records = to_records(table, names);
        let merge = self.persist(store_id, records, |r: &CommuneRecord<T>| r.key(), summary)?;
        summary.stores.push(StoreReport {
            store_id: store_id.to_string(),
            fetched,
            reconciled,
            complete: true,
            merge,
        });
        Ok(())
    }

    fn load_rows(&self, spec: &DatasetSpec) -> Result<BTreeMap<EntityKey, NormalizedRow>> {
        self.store.load(spec.store_id, spec.key_of())
    }

    fn load_insee_mapping(&self) -> Result<InseeMapping> {
        Ok(read_json(&self.config.artifact_path(INSEE_MAPPING_ARTIFACT))?.unwrap_or_default())
    }

    fn run_schools(&mut self, summary: &mut RunSummary) -> Result<()> {
        let catalog: Vec<DatasetSpec> = datasets::education_datasets()
            .into_iter()
            .chain(datasets::enrollment_datasets())
            .collect();
        let find = |id: &str| catalog_entry(&catalog, id);

        let directory = self.load_rows(find(datasets::DIRECTORY)?)?;
        anyhow::ensure!(
            !directory.is_empty(),
            "The directory store is empty; run the education step first"
        );

        let ips_ecoles = self.load_rows(find(datasets::IPS_ECOLES)?)?;
        let ips_colleges = self.load_rows(find(datasets::IPS_COLLEGES)?)?;
        let ips_lycees = self.load_rows(find(datasets::IPS_LYCEES)?)?;
        let brevet = self.load_rows(find(datasets::BREVET)?)?;
        let bac = self.load_rows(find(datasets::BAC)?)?;
        let enrollment_ecoles = self.load_rows(find(datasets::ENROLLMENT_ECOLES)?)?;
        let enrollment_colleges = self.load_rows(find(datasets::ENROLLMENT_COLLEGES)?)?;
        let enrollment_lycees = self.load_rows(find(datasets::ENROLLMENT_LYCEES)?)?;
        let languages: BTreeMap<EntityKey, LanguageOffering> = self
            .store
            .load(datasets::LANGUAGES_STORE, |r: &LanguageRecord| r.key())?
            .into_iter()
            .map(|(key, record)| (key, record.offering))
            .collect();

        let mut mapping = self.load_insee_mapping()?;
        self.resolve_locations(&directory, &mut mapping)?;

        let tables = SchoolTables {
            ips_ecoles: Some(&ips_ecoles),
            ips_colleges: Some(&ips_colleges),
            ips_lycees: Some(&ips_lycees),
            enrollment_ecoles: Some(&enrollment_ecoles),
            enrollment_colleges: Some(&enrollment_colleges),
            enrollment_lycees: Some(&enrollment_lycees),
            brevet: Some(&brevet),
            bac: Some(&bac),
            languages: Some(&languages),
        };

        let report = assemble_schools(&directory, &tables, &self.rules, Some(&mapping));
        let path = self.config.artifact_path(SCHOOLS_ARTIFACT);
        write_json_atomic(&path, &report.entities)?;
        info!(path = %path.display(), schools = report.entities.len(), "schools artifact written");

        summary.artifacts.push(ArtifactReport {
            path,
            entities: report.entities.len(),
            join: report.stats,
        });
        Ok(())
    }

    /// Resolve every directory location not cached yet, then save the cache
    fn resolve_locations(&self, directory: &BTreeMap<EntityKey, NormalizedRow>, mapping: &mut InseeMapping) -> Result<()> {
        let locations: BTreeSet<(String, String)> = directory
            .values()
            .filter_map(|row| Some((row.year("code_postal")?, row.text("nom_commune")?.to_string())))
            .filter(|(postal, city)| !mapping.contains_key(&location_key(postal, city)))
            .collect();

        if locations.is_empty() {
            return Ok(());
        }

        let mut resolver = GeoResolver::new(self.geo, &self.config.geo_api);
        resolver.resolve_all(locations.iter().map(|(p, c)| (p.as_str(), c.as_str())), mapping);
        write_json_atomic(&self.config.artifact_path(INSEE_MAPPING_ARTIFACT), mapping)
    }

    fn run_communes(&mut self, summary: &mut RunSummary) -> Result<()> {
        let mayors: BTreeMap<EntityKey, CommuneRecord<Mayor>> =
            self.store.load(MAYORS_STORE, |r: &CommuneRecord<Mayor>| r.key())?;
        let municipal: BTreeMap<EntityKey, CommuneRecord<MunicipalResult>> =
            self.store.load(MUNICIPAL_STORE, |r: &CommuneRecord<MunicipalResult>| r.key())?;
        let presidential: BTreeMap<EntityKey, CommuneRecord<ElectionResult>> =
            self.store.load(PRESIDENTIAL_STORE, |r: &CommuneRecord<ElectionResult>| r.key())?;
        let legislative: BTreeMap<EntityKey, CommuneRecord<ElectionResult>> =
            self.store.load(LEGISLATIVE_STORE, |r: &CommuneRecord<ElectionResult>| r.key())?;

        let resolved_names = names_by_code(&self.load_insee_mapping()?);

        let tables = CommuneTables {
            mayors: Some(&mayors),
            municipal: Some(&municipal),
            presidential: Some(&presidential),
            legislative: Some(&legislative),
        };
        let report = assemble_communes(&tables, &resolved_names);
        let count = report.entities.len();

        let path = self.config.artifact_path(COMMUNES_ARTIFACT);
        write_json_atomic(&path, &index_by_code(report.entities))?;
        info!(path = %path.display(), communes = count, "communes artifact written");

        summary.artifacts.push(ArtifactReport {
            path,
            entities: count,
            join: report.stats,
        });
        Ok(())
    }
}

fn catalog_entry<'c>(catalog: &'c [DatasetSpec], id: &str) -> Result<&'c DatasetSpec> {
    catalog
        .iter()
        .find(|d| d.id == id)
        .with_context(|| format!("Dataset {} missing from the catalog", id))
}

fn store_for(kind: ElectionKind) -> &'static str {
    match kind {
        ElectionKind::Municipal => MUNICIPAL_STORE,
        ElectionKind::Presidential => PRESIDENTIAL_STORE,
        ElectionKind::Legislative => LEGISLATIVE_STORE,
    }
}

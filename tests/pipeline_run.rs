// End-to-end runs against a fake upstream: catalog pages, geo lookups, CSV exports

use carte_scolaire::artifact::read_json;
use carte_scolaire::config::ElectionConfig;
use carte_scolaire::election::MayorSource;
use carte_scolaire::entities::{ExamResults, IpsValue};
use carte_scolaire::pipeline::{COMMUNES_ARTIFACT, INSEE_MAPPING_ARTIFACT, SCHOOLS_ARTIFACT};
use carte_scolaire::{
    load_artifacts, ApiConfig, Commune, FetchError, Pipeline, PipelineConfig, Region, SchoolType, Step, Transport, Validator,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const CATALOG: &str = "https://catalog.test/datasets";
const GEO: &str = "https://geo.test";
const MAYORS_CSV: &str = "https://exports.test/rne.csv";

struct FakeUpstream {
    datasets: BTreeMap<String, Vec<Value>>,
    failing: BTreeSet<String>,
    exports: BTreeMap<String, Vec<u8>>,
    geo_requests: RefCell<Vec<String>>,
}

fn envelope(fields: Value) -> Value {
    json!({ "record": { "id": "x", "fields": fields } })
}

fn query_value<'q>(query: &'q [(String, String)], name: &str) -> Option<&'q str> {
    query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

impl FakeUpstream {
    fn new() -> Self {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "fr-en-annuaire-education".to_string(),
            vec![
                envelope(json!({
                    "identifiant_de_l_etablissement": "0440021J",
                    "nom_etablissement": "Collège Aristide Briand site Erdre",
                    "type_etablissement": "Collège",
                    "libelle_nature": "COLLEGE",
                    "latitude": 47.25, "longitude": -1.52,
                    "code_postal": "44000", "nom_commune": "Nantes"
                })),
                envelope(json!({
                    "identifiant_de_l_etablissement": "0440021J",
                    "nom_etablissement": "Collège Aristide Briand",
                    "type_etablissement": "Collège",
                    "libelle_nature": "COLLEGE",
                    "statut_public_prive": "Public",
                    "latitude": 47.2184, "longitude": -1.5536,
                    "code_postal": "44000", "nom_commune": "Nantes", "code_commune": "44109"
                })),
                envelope(json!({
                    "identifiant_de_l_etablissement": "0850100A",
                    "nom_etablissement": "Ecole élémentaire Pont Boileau",
                    "type_etablissement": "Ecole",
                    "libelle_nature": "ECOLE DE NIVEAU ELEMENTAIRE",
                    "ecole_elementaire": "1",
                    "nombre_d_eleves": 120,
                    "latitude": 46.67, "longitude": -1.43,
                    "code_postal": 85000, "nom_commune": "La Roche-sur-Yon"
                })),
                envelope(json!({
                    "identifiant_de_l_etablissement": "0440200B",
                    "nom_etablissement": "Lycée professionnel Leloup",
                    "type_etablissement": "Lycée",
                    "libelle_nature": "LYCEE PROFESSIONNEL",
                    "latitude": 47.2, "longitude": -1.5,
                    "code_postal": "44000", "nom_commune": "Nantes"
                })),
                envelope(json!({
                    "identifiant_de_l_etablissement": "0440300C",
                    "nom_etablissement": "Ecole maternelle Les Lilas",
                    "type_etablissement": "Ecole",
                    "libelle_nature": "ECOLE MATERNELLE",
                    "ecole_elementaire": "0",
                    "latitude": 47.2, "longitude": -1.5,
                    "code_postal": "44000", "nom_commune": "Nantes"
                })),
            ],
        );
        datasets.insert(
            "fr-en-ips-colleges-ap2023".to_string(),
            vec![
                envelope(json!({"uai": "0440021J", "rentree_scolaire": "2022-2023", "ips": 101.0})),
                envelope(json!({"uai": "0440021J", "rentree_scolaire": "2023-2024", "ips": "104,5"})),
            ],
        );
        datasets.insert(
            "fr-en-ips-ecoles-ap2022".to_string(),
            vec![envelope(json!({"uai": "0850100A", "rentree_scolaire": "2022-2023", "ips": "NS"}))],
        );
        datasets.insert(
            "fr-en-college-effectifs-niveau-sexe-lv".to_string(),
            vec![envelope(json!({
                "numero_college": "0440021J",
                "rentree_scolaire": 2023,
                "nombre_total_eleves": 500,
                "nombre_total_classes": 20
            }))],
        );
        datasets.insert(
            "fr-en-dnb-par-etablissement".to_string(),
            vec![envelope(json!({
                "numero_d_etablissement": "0440021J",
                "session": 2023,
                "taux_de_reussite": 94.2,
                "inscrits": 120, "presents": 118, "admis": 111
            }))],
        );
        datasets.insert(
            "fr-en-offre-langues-2d".to_string(),
            vec![
                envelope(json!({"uai": "0440021J", "langues": "ANGLAIS", "enseignements": "LV1"})),
                envelope(json!({"uai": "0440021J", "langues": "ESPAGNOL", "enseignements": "LV2"})),
            ],
        );

        let mut exports = BTreeMap::new();
        let rne = "Code de la commune;Code du département;Nom de la fonction;Prénom de l'élu·e;Nom de l'élu·e\n\
                   44109;44;Maire;Johanna;Rolland\n\
                   44109;44;Adjoint au maire;Bassem;Asseh\n\
                   75056;75;Maire;Anne;Hidalgo\n";
        exports.insert(MAYORS_CSV.to_string(), rne.as_bytes().to_vec());

        FakeUpstream {
            datasets,
            failing: BTreeSet::new(),
            exports,
            geo_requests: RefCell::new(Vec::new()),
        }
    }

    fn failing(mut self, dataset_id: &str) -> Self {
        self.failing.insert(dataset_id.to_string());
        self
    }

    fn page(&self, dataset_id: &str, query: &[(String, String)]) -> Value {
        let records = self.datasets.get(dataset_id).cloned().unwrap_or_default();
        let limit: usize = query_value(query, "limit").and_then(|v| v.parse().ok()).unwrap_or(100);
        let offset: usize = query_value(query, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
        let slice: Vec<Value> = records.iter().skip(offset).take(limit).cloned().collect();
        json!({ "total_count": records.len(), "records": slice })
    }

    fn communes(&self, postal_code: &str) -> Value {
        self.geo_requests.borrow_mut().push(postal_code.to_string());
        match postal_code {
            "44000" => json!([{"code": "44109", "nom": "Nantes"}]),
            "85000" => json!([
                {"code": "85128", "nom": "Mouilleron-le-Captif"},
                {"code": "85191", "nom": "La Roche-sur-Yon"}
            ]),
            _ => json!([]),
        }
    }
}

impl Transport for FakeUpstream {
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        let body = if let Some(export) = self.exports.get(url) {
            return Ok(export.clone());
        } else if url == format!("{}/communes", GEO) {
            self.communes(query_value(query, "codePostal").unwrap_or(""))
        } else if let Some(dataset_id) = url
            .strip_prefix(CATALOG)
            .and_then(|rest| rest.strip_suffix("/records"))
            .map(|rest| rest.trim_start_matches('/'))
        {
            if self.failing.contains(dataset_id) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 503,
                });
            }
            self.page(dataset_id, query)
        } else {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            });
        };
        Ok(serde_json::to_vec(&body).unwrap())
    }
}

fn test_config(data_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: data_dir.to_path_buf(),
        regions: vec![Region::pays_de_la_loire()],
        education_api: ApiConfig {
            base_url: CATALOG.to_string(),
            request_delay_ms: 0,
            page_size: 2,
            ..ApiConfig::education()
        },
        geo_api: ApiConfig {
            base_url: GEO.to_string(),
            request_delay_ms: 0,
            ..ApiConfig::geo()
        },
        elections: ElectionConfig {
            mayors: MayorSource {
                url: MAYORS_CSV.to_string(),
                ..MayorSource::default()
            },
            sources: Vec::new(),
            ..ElectionConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn run(config: &PipelineConfig, upstream: &FakeUpstream, step: Step) -> carte_scolaire::RunSummary {
    let mut pipeline = Pipeline::new(config.clone(), upstream, upstream).unwrap();
    pipeline.run(step).unwrap()
}

#[test]
fn test_full_run_writes_valid_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let upstream = FakeUpstream::new();

    let summary = run(&config, &upstream, Step::All);
    assert!(summary.incomplete().is_empty());
    assert!(summary.ledger_events > 0);
    assert!(dir.path().join(SCHOOLS_ARTIFACT).exists());
    assert!(dir.path().join(COMMUNES_ARTIFACT).exists());
    assert!(dir.path().join(INSEE_MAPPING_ARTIFACT).exists());
    assert!(dir.path().join("provenance.db").exists());

    let (schools, communes) = load_artifacts(dir.path()).unwrap();
    assert_eq!(schools.len(), 2, "professional high school and nursery school are out of scope");

    let college = schools.iter().find(|s| s.uai.as_str() == "0440021J").unwrap();
    assert_eq!(college.name, "Collège Aristide Briand");
    assert_eq!(college.school_type, SchoolType::MiddleSchool);
    assert_eq!(college.ips.as_ref().unwrap().value, IpsValue::Score(104.5));
    assert_eq!(college.class_size, Some(25.0));
    assert!(matches!(college.exam_results, Some(ExamResults::Brevet(_))));
    assert_eq!(college.languages.as_ref().unwrap().lv1, vec!["ANGLAIS".to_string()]);
    assert_eq!(college.address.insee_code.as_deref(), Some("44109"));

    let school = schools.iter().find(|s| s.uai.as_str() == "0850100A").unwrap();
    assert_eq!(school.address.insee_code.as_deref(), Some("85191"));
    assert_eq!(school.ips.as_ref().unwrap().value, IpsValue::Label("NS".to_string()));
    assert_eq!(school.class_size, None);
    assert_eq!(school.estimated_class_size, Some(24.0));
    assert!(school.languages.is_none());

    // resolved school communes join the ones with political data
    assert_eq!(communes.len(), 2);
    assert_eq!(communes["85191"].commune_name, "La Roche-sur-Yon");
    assert!(communes["85191"].mayor.is_none());
    let nantes = &communes["44109"];
    assert_eq!(nantes.commune_name, "Nantes");
    assert_eq!(nantes.mayor.as_ref().unwrap().last_name, "Rolland");

    let report = Validator::new(&config).validate(&schools, &communes);
    assert!(!report.has_critical(), "{:?}", report.violations);
}

#[test]
fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let upstream = FakeUpstream::new();

    run(&config, &upstream, Step::All);
    let first = std::fs::read(dir.path().join(SCHOOLS_ARTIFACT)).unwrap();
    let geo_calls = upstream.geo_requests.borrow().len();

    let summary = run(&config, &upstream, Step::All);
    assert_eq!(summary.ledger_events, 0);
    assert!(summary.stores.iter().all(|s| s.merge.inserted == 0 && s.merge.replaced == 0));
    assert_eq!(upstream.geo_requests.borrow().len(), geo_calls, "cached locations are not looked up again");
    assert_eq!(std::fs::read(dir.path().join(SCHOOLS_ARTIFACT)).unwrap(), first);
}

#[test]
fn test_failed_dataset_preserves_stored_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    run(&config, &FakeUpstream::new(), Step::All);

    let degraded = FakeUpstream::new().failing("fr-en-ips-colleges-ap2023");
    let summary = run(&config, &degraded, Step::All);

    let ips = summary.stores.iter().find(|s| s.store_id == "ips_colleges").unwrap();
    assert!(!ips.complete);
    assert_eq!(ips.merge.preserved, 1);
    assert_eq!(summary.incomplete(), vec!["ips_colleges"]);

    let (schools, _) = load_artifacts(dir.path()).unwrap();
    let college = schools.iter().find(|s| s.uai.as_str() == "0440021J").unwrap();
    assert_eq!(college.ips.as_ref().unwrap().value, IpsValue::Score(104.5));
}

#[test]
fn test_ledger_records_only_changes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let upstream = FakeUpstream::new();

    let mut pipeline = Pipeline::new(config.clone(), &upstream, &upstream).unwrap();
    pipeline.run(Step::Education).unwrap();
    pipeline.run(Step::Education).unwrap();

    let ledger = pipeline.ledger().unwrap();
    let history = ledger.history("annuaire", "0440021J").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "inserted");
    assert_eq!(history[0].run_id, ledger.run_id());
}

#[test]
fn test_schools_step_requires_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let upstream = FakeUpstream::new();

    let mut pipeline = Pipeline::new(config, &upstream, &upstream).unwrap();
    assert!(pipeline.run(Step::Schools).is_err());
}

#[test]
fn test_missing_mayor_export_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    run(&config, &FakeUpstream::new(), Step::Political);

    let mut offline = FakeUpstream::new();
    offline.exports.clear();
    let summary = run(&config, &offline, Step::Political);
    assert!(summary.stores.iter().all(|s| s.store_id != "mayors"));

    run(&config, &offline, Step::Communes);
    let communes: BTreeMap<String, Commune> = read_json(&dir.path().join(COMMUNES_ARTIFACT)).unwrap().unwrap();
    assert!(communes["44109"].mayor.is_some());
}

// ⚙️ Pipeline Configuration - TOML file with built-in defaults
// Every field is optional in the file; absent fields keep the defaults below.

use crate::election::{default_sources, ElectionSource, MayorSource};
use crate::rules::{ClassifierMarkers, SchoolRules, TrackPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// REGIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    /// Short code ("17", "44")
    pub code: String,

    /// Upper-case name as the enrollment datasets spell it
    pub name: String,
}

impl Department {
    fn new(code: &str, name: &str) -> Self {
        Department {
            code: code.to_string(),
            name: name.to_string(),
        }
    }

    /// Three-digit form used by the Brevet dataset ("017")
    pub fn padded(&self) -> String {
        format!("{:0>3}", self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude) && (self.lon_min..=self.lon_max).contains(&longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub name_upper: String,
    pub code: String,
    pub departments: Vec<Department>,
    pub bounds: BoundingBox,
}

impl Region {
    pub fn pays_de_la_loire() -> Self {
        Region {
            name: "Pays de la Loire".to_string(),
            name_upper: "PAYS DE LA LOIRE".to_string(),
            code: "52".to_string(),
            departments: vec![
                Department::new("44", "LOIRE-ATLANTIQUE"),
                Department::new("49", "MAINE-ET-LOIRE"),
                Department::new("53", "MAYENNE"),
                Department::new("72", "SARTHE"),
                Department::new("85", "VENDEE"),
            ],
            bounds: BoundingBox {
                lat_min: 46.2,
                lat_max: 48.6,
                lon_min: -2.6,
                lon_max: 1.0,
            },
        }
    }

    pub fn nouvelle_aquitaine() -> Self {
        Region {
            name: "Nouvelle-Aquitaine".to_string(),
            name_upper: "NOUVELLE-AQUITAINE".to_string(),
            code: "75".to_string(),
            departments: vec![
                Department::new("16", "CHARENTE"),
                Department::new("17", "CHARENTE-MARITIME"),
                Department::new("19", "CORREZE"),
                Department::new("23", "CREUSE"),
                Department::new("24", "DORDOGNE"),
                Department::new("33", "GIRONDE"),
                Department::new("40", "LANDES"),
                Department::new("47", "LOT-ET-GARONNE"),
                Department::new("64", "PYRENEES-ATLANTIQUES"),
                Department::new("79", "DEUX-SEVRES"),
                Department::new("86", "VIENNE"),
                Department::new("87", "HAUTE-VIENNE"),
            ],
            bounds: BoundingBox {
                lat_min: 42.7,
                lat_max: 47.2,
                lon_min: -1.9,
                lon_max: 2.7,
            },
        }
    }
}

// ============================================================================
// UPSTREAM APIS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,

    /// Minimum pause between two requests
    pub request_delay_ms: u64,

    pub page_size: usize,

    /// Upstream rejects offsets beyond this
    pub max_offset: usize,

    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl ApiConfig {
    pub fn education() -> Self {
        ApiConfig {
            base_url: "https://data.education.gouv.fr/api/v2/catalog/datasets".to_string(),
            request_delay_ms: 500,
            page_size: 100,
            max_offset: 10_000,
            request_timeout_secs: 30,
            user_agent: concat!("carte-scolaire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn geo() -> Self {
        ApiConfig {
            base_url: "https://geo.api.gouv.fr".to_string(),
            // ~45 requests per second, under the 50/s quota
            request_delay_ms: 22,
            request_timeout_secs: 10,
            ..Self::education()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::education()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Upper bound of the wide-format candidate loop
    pub max_candidate_slots: usize,

    pub mayors: MayorSource,
    pub sources: Vec<ElectionSource>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        ElectionConfig {
            max_candidate_slots: 30,
            mayors: MayorSource::default(),
            sources: default_sources(),
        }
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub regions: Vec<Region>,
    pub education_api: ApiConfig,

    /// Missing keys of a `[geo_api]` table fall back to the education
    /// defaults, so a partial table should restate `base_url`
    pub geo_api: ApiConfig,

    pub high_school_policy: TrackPolicy,

    /// Words marking a secondary campus in a school name
    pub satellite_keywords: Vec<String>,

    pub classifier: ClassifierMarkers,

    /// Nuance code → label, on top of the built-in table
    pub party_labels: BTreeMap<String, String>,

    pub elections: ElectionConfig,

    /// Vintage stamped on language offerings when the rows carry none
    pub languages_vintage: String,

    /// SQLite provenance ledger, relative to `data_dir` unless absolute;
    /// `None` disables recording
    pub ledger_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_dir: PathBuf::from("data"),
            regions: vec![Region::pays_de_la_loire(), Region::nouvelle_aquitaine()],
            education_api: ApiConfig::education(),
            geo_api: ApiConfig::geo(),
            high_school_policy: TrackPolicy::default(),
            satellite_keywords: ["site", "campus", "pôle", "antenne"].iter().map(|s| s.to_string()).collect(),
            classifier: ClassifierMarkers::default(),
            party_labels: BTreeMap::new(),
            elections: ElectionConfig::default(),
            languages_vintage: "2024-2025".to_string(),
            ledger_path: Some(PathBuf::from("provenance.db")),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse pipeline configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// File when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Keep only the named region (matched case-insensitively)
    pub fn restrict_to_region(&mut self, name: &str) -> Result<()> {
        let wanted = name.to_lowercase();
        self.regions.retain(|r| r.name.to_lowercase() == wanted || r.code == name);
        anyhow::ensure!(!self.regions.is_empty(), "Unknown region: {}", name);
        Ok(())
    }

    pub fn departments(&self) -> impl Iterator<Item = &Department> {
        self.regions.iter().flat_map(|r| r.departments.iter())
    }

    /// Short department codes of every configured region
    pub fn department_codes(&self) -> BTreeSet<String> {
        self.departments().map(|d| d.code.clone()).collect()
    }

    pub fn school_rules(&self) -> SchoolRules {
        SchoolRules::new(&self.classifier, self.high_school_policy)
    }

    pub fn ledger_file(&self) -> Option<PathBuf> {
        self.ledger_path.as_ref().map(|p| self.data_dir.join(p))
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.education_api.request_delay_ms, 500);
        assert_eq!(config.geo_api.request_delay_ms, 22);
        assert_eq!(config.education_api.max_offset, 10_000);
        assert_eq!(config.elections.max_candidate_slots, 30);
        assert_eq!(config.high_school_policy, TrackPolicy::GeneralOnly);
        assert!(config.department_codes().contains("17"));
        assert!(config.department_codes().contains("44"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            data_dir = "/tmp/carte"
            high_school_policy = "general_or_technological"
            satellite_keywords = ["annexe"]

            [education_api]
            request_delay_ms = 0

            [party_labels]
            LDVG = "Gauche locale"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/carte"));
        assert_eq!(config.high_school_policy, TrackPolicy::GeneralOrTechnological);
        assert_eq!(config.satellite_keywords, vec!["annexe".to_string()]);
        assert_eq!(config.education_api.request_delay_ms, 0);
        assert_eq!(config.education_api.page_size, 100);
        assert_eq!(config.party_labels["LDVG"], "Gauche locale");
        assert_eq!(config.elections.sources.len(), default_sources().len());
    }

    #[test]
    fn test_bounds_and_departments() {
        let config = PipelineConfig::default();
        let in_bounds = |lat: f64, lon: f64| config.regions.iter().any(|r| r.bounds.contains(lat, lon));
        assert!(in_bounds(47.2184, -1.5536)); // Nantes
        assert!(in_bounds(44.8378, -0.5792)); // Bordeaux
        assert!(!in_bounds(48.8566, 2.3522)); // Paris

        let charente_maritime = config.departments().find(|d| d.code == "17").unwrap();
        assert_eq!(charente_maritime.padded(), "017");
    }

    #[test]
    fn test_restrict_to_region() {
        let mut config = PipelineConfig::default();
        config.restrict_to_region("pays de la loire").unwrap();
        assert_eq!(config.regions.len(), 1);
        assert!(!config.department_codes().contains("17"));

        let mut other = PipelineConfig::default();
        assert!(other.restrict_to_region("Bretagne").is_err());
    }
}

// 📚 Dataset Catalog - what to fetch, how to key it, which row wins
// One entry per upstream education dataset; the schema is fixed per entry.

use crate::config::Region;
use crate::entities::school::{CampusPreference, LanguageOffering};
use crate::normalizer::{NormalizedRow, RowSchema};
use crate::reconciler::{reconcile, EntityKey, KeyKind, MostRecent, Reconciled};
use crate::rules::SchoolRules;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const DIRECTORY: &str = "fr-en-annuaire-education";
pub const IPS_ECOLES: &str = "fr-en-ips-ecoles-ap2022";
pub const IPS_COLLEGES: &str = "fr-en-ips-colleges-ap2023";
pub const IPS_LYCEES: &str = "fr-en-ips-lycees-ap2023";
pub const BREVET: &str = "fr-en-dnb-par-etablissement";
pub const BAC: &str = "fr-en-indicateurs-de-resultat-des-lycees-gt_v2";
pub const ENROLLMENT_ECOLES: &str = "fr-en-ecoles-effectifs-nb_classes";
pub const ENROLLMENT_COLLEGES: &str = "fr-en-college-effectifs-niveau-sexe-lv";
pub const ENROLLMENT_LYCEES: &str = "fr-en-lycee_gt-effectifs-niveau-sexe-lv";
pub const LANGUAGES: &str = "fr-en-offre-langues-2d";

// ============================================================================
// FILTERS
// ============================================================================

/// Quote a value for a `where` clause
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

/// How a dataset is restricted to a region
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// `field='Pays de la Loire'`
    RegionName(&'static str),

    /// `field='PAYS DE LA LOIRE'`
    RegionUpper(&'static str),

    /// `field='44' OR field='49' ...`
    DepartmentCodes(&'static str),

    /// Three-digit codes: `field='044' OR ...`
    PaddedDepartmentCodes(&'static str),

    /// `field='LOIRE-ATLANTIQUE' OR ...`
    DepartmentNames(&'static str),
}

impl FilterKind {
    pub fn clause(&self, region: &Region) -> String {
        let any_of = |field: &str, values: Vec<String>| -> String {
            values
                .iter()
                .map(|v| format!("{}={}", field, quote(v)))
                .collect::<Vec<_>>()
                .join(" OR ")
        };

        match self {
            FilterKind::RegionName(field) => format!("{}={}", field, quote(&region.name)),
            FilterKind::RegionUpper(field) => format!("{}={}", field, quote(&region.name_upper)),
            FilterKind::DepartmentCodes(field) => {
                any_of(field, region.departments.iter().map(|d| d.code.clone()).collect())
            }
            FilterKind::PaddedDepartmentCodes(field) => {
                any_of(field, region.departments.iter().map(|d| d.padded()).collect())
            }
            FilterKind::DepartmentNames(field) => {
                any_of(field, region.departments.iter().map(|d| d.name.clone()).collect())
            }
        }
    }
}

// ============================================================================
// CATALOG
// ============================================================================

/// Which row survives per key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Scope filter, then the main campus
    Directory,

    /// Highest value of the given year field
    MostRecent(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub id: &'static str,
    pub store_id: &'static str,
    pub schema: RowSchema,
    pub key_field: &'static str,
    pub key_kind: KeyKind,
    pub selection: Selection,
    pub filter: FilterKind,
}

impl DatasetSpec {
    fn new(
        id: &'static str,
        store_id: &'static str,
        key_field: &'static str,
        selection: Selection,
        filter: FilterKind,
    ) -> Self {
        DatasetSpec {
            id,
            store_id,
            schema: RowSchema::record_fields(),
            key_field,
            key_kind: KeyKind::Uai,
            selection,
            filter,
        }
    }

    /// One where-clause per region, fetched separately
    pub fn filters(&self, regions: &[Region]) -> Vec<String> {
        regions.iter().map(|r| self.filter.clause(r)).collect()
    }

    pub fn key_of(&self) -> impl Fn(&NormalizedRow) -> Option<EntityKey> {
        self.key_kind.key_of(self.key_field)
    }

    /// One row per UAI according to the dataset's selection
    pub fn reconcile(&self, rows: Vec<NormalizedRow>, rules: &SchoolRules, satellite_keywords: &[String]) -> Reconciled<NormalizedRow> {
        match &self.selection {
            Selection::Directory => {
                let total = rows.len();
                let scoped: Vec<NormalizedRow> = rows
                    .into_iter()
                    .filter(|row| rules.include_in_scope(row, rules.classify(row)))
                    .collect();
                debug!(dataset = self.id, total, in_scope = scoped.len(), "scope filter applied");
                reconcile(scoped, self.key_of(), &CampusPreference::new(satellite_keywords))
            }
            Selection::MostRecent(field) => reconcile(rows, self.key_of(), &MostRecent::new(field)),
        }
    }
}

pub fn directory() -> DatasetSpec {
    DatasetSpec::new(
        DIRECTORY,
        "annuaire",
        "identifiant_de_l_etablissement",
        Selection::Directory,
        FilterKind::RegionName("libelle_region"),
    )
}

/// Directory, IPS and exam results
pub fn education_datasets() -> Vec<DatasetSpec> {
    vec![
        directory(),
        DatasetSpec::new(
            IPS_ECOLES,
            "ips_ecoles",
            "uai",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::RegionUpper("region"),
        ),
        DatasetSpec::new(
            IPS_COLLEGES,
            "ips_colleges",
            "uai",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::DepartmentCodes("code_du_departement"),
        ),
        DatasetSpec::new(
            IPS_LYCEES,
            "ips_lycees",
            "uai",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::DepartmentCodes("code_du_departement"),
        ),
        DatasetSpec::new(
            BREVET,
            "brevet",
            "numero_d_etablissement",
            Selection::MostRecent("session"),
            FilterKind::PaddedDepartmentCodes("code_departement"),
        ),
        DatasetSpec::new(
            BAC,
            "bac",
            "uai",
            Selection::MostRecent("annee"),
            FilterKind::DepartmentCodes("code_departement"),
        ),
    ]
}

pub fn enrollment_datasets() -> Vec<DatasetSpec> {
    vec![
        DatasetSpec::new(
            ENROLLMENT_ECOLES,
            "enrollment_ecoles",
            "numero_ecole",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::DepartmentNames("departement"),
        ),
        DatasetSpec::new(
            ENROLLMENT_COLLEGES,
            "enrollment_colleges",
            "numero_college",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::DepartmentCodes("code_dept"),
        ),
        DatasetSpec::new(
            ENROLLMENT_LYCEES,
            "enrollment_lycees",
            "numero_lycee",
            Selection::MostRecent("rentree_scolaire"),
            FilterKind::DepartmentCodes("code_departement_pays"),
        ),
    ]
}

pub const LANGUAGES_STORE: &str = "languages";

pub fn languages_filter() -> FilterKind {
    FilterKind::RegionName("region")
}

// ============================================================================
// LANGUAGE OFFERINGS
// ============================================================================

/// Stored element of the languages store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageRecord {
    pub uai: String,

    #[serde(flatten)]
    pub offering: LanguageOffering,
}

impl LanguageRecord {
    pub fn key(&self) -> Option<EntityKey> {
        EntityKey::uai(&self.uai)
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// One record per UAI with LV1, LV2 and all languages in first-seen order
pub fn aggregate_languages(rows: &[NormalizedRow], default_vintage: &str) -> BTreeMap<EntityKey, LanguageRecord> {
    let mut by_school: BTreeMap<EntityKey, LanguageRecord> = BTreeMap::new();

    for row in rows {
        let (Some(key), Some(language)) = (row.text("uai").and_then(EntityKey::uai), row.text("langues")) else {
            continue;
        };

        let record = by_school.entry(key.clone()).or_insert_with(|| LanguageRecord {
            uai: key.to_string(),
            offering: LanguageOffering {
                year: row
                    .year("rentree_scolaire")
                    .unwrap_or_else(|| default_vintage.to_string()),
                ..Default::default()
            },
        });

        let offering = &mut record.offering;
        push_unique(&mut offering.all_languages, language);
        match row.text("enseignements") {
            Some("LV1") => push_unique(&mut offering.lv1, language),
            Some("LV2") => push_unique(&mut offering.lv2, language),
            _ => {}
        }
    }

    by_school
}

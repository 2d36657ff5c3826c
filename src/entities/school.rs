// 🏫 School Entity - composite built from the directory plus side tables
//
// Base rows come from the education directory; IPS, enrollment, exam results
// and language offerings attach by UAI when the school type matches.

use crate::datasets;
use crate::insee::{location_key, InseeMapping};
use crate::joiner::{Applicability, Composite, JoinReport, Joiner, KeyedTable, SourceRef};
use crate::normalizer::NormalizedRow;
use crate::reconciler::{Choice, EntityKey, Priority};
use crate::rules::{SchoolRules, SchoolType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

// ============================================================================
// SUB-RECORDS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub department: Option<String>,

    /// INSEE code of the commune, used to join political data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insee_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
}

/// IPS is published as a number, or as a label such as "NS" when the
/// cohort is too small
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpsValue {
    Score(f64),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpsRecord {
    pub value: IpsValue,
    pub year: String,
    pub ecart_type: Option<f64>,
    pub national_average: Option<f64>,
    pub academique_average: Option<f64>,
    pub departemental_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub year: String,
    pub student_count: Option<i64>,
    pub number_of_classes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mentions {
    pub sans_mention: Option<i64>,
    pub assez_bien: Option<i64>,
    pub bien: Option<i64>,
    pub tres_bien: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrevetResults {
    pub year: String,
    pub success_rate: Option<f64>,
    pub students_registered: Option<i64>,
    pub students_present: Option<i64>,
    pub students_admitted: Option<i64>,
    pub mentions: Mentions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacResults {
    pub year: String,
    pub success_rate: Option<f64>,
    pub access_rate_2nde: Option<f64>,
    pub access_rate_1ere: Option<f64>,
    pub access_rate_term: Option<f64>,
    pub value_added_success: Option<f64>,
    pub value_added_access_2nde: Option<f64>,
    pub students_2nde: Option<i64>,
    pub students_1ere: Option<i64>,
    pub students_term: Option<i64>,
    pub students_present: Option<i64>,
}

impl BacResults {
    /// Head-count over the three high-school grades
    pub fn grade_total(&self) -> i64 {
        [self.students_2nde, self.students_1ere, self.students_term]
            .iter()
            .flatten()
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExamResults {
    #[serde(rename = "Brevet")]
    Brevet(BrevetResults),

    #[serde(rename = "Baccalauréat")]
    Bac(BacResults),
}

impl ExamResults {
    pub fn year(&self) -> &str {
        match self {
            ExamResults::Brevet(b) => &b.year,
            ExamResults::Bac(b) => &b.year,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageOffering {
    pub year: String,
    pub lv1: Vec<String>,
    pub lv2: Vec<String>,
    pub all_languages: Vec<String>,
}

// ============================================================================
// SCHOOL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub uai: EntityKey,
    pub name: String,

    #[serde(rename = "type")]
    pub school_type: SchoolType,

    pub public_private: Option<String>,
    pub address: Address,
    pub coordinates: Coordinates,
    pub contact: Contact,

    /// Head-count printed in the directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_count: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<IpsRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<Enrollment>,

    /// Measured: students / classes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_size: Option<f64>,

    /// Fallback from assumed class sizes, never measured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_class_size: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_results: Option<ExamResults>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<LanguageOffering>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
}

impl Composite for School {
    type Tag = SchoolType;

    fn key(&self) -> &EntityKey {
        &self.uai
    }

    fn tag(&self) -> SchoolType {
        self.school_type
    }

    fn record_source(&mut self, section: &str, dataset: &str) {
        self.sources.push(SourceRef {
            section: section.to_string(),
            dataset: dataset.to_string(),
        });
    }
}

fn owned_text(row: &NormalizedRow, field: &str) -> Option<String> {
    row.text(field).map(|s| s.to_string())
}

impl School {
    /// Base entity from a directory row; `None` for rows that cannot be
    /// placed on the map
    pub fn from_directory(row: &NormalizedRow, rules: &SchoolRules) -> Option<School> {
        let uai = EntityKey::uai(row.text("identifiant_de_l_etablissement")?)?;

        let school_type = rules.classify(row);
        if !school_type.is_known() {
            return None;
        }

        let coordinates = Coordinates {
            latitude: row.number("latitude")?,
            longitude: row.number("longitude")?,
        };
        if !coordinates.is_valid() {
            return None;
        }

        let insee_code = row
            .year("code_commune")
            .and_then(|code| EntityKey::insee(&code))
            .map(|key| key.to_string());

        Some(School {
            uai,
            name: owned_text(row, "nom_etablissement").unwrap_or_default(),
            school_type,
            public_private: owned_text(row, "statut_public_prive"),
            address: Address {
                street: owned_text(row, "adresse_1"),
                postal_code: row.year("code_postal"),
                city: owned_text(row, "nom_commune"),
                department: owned_text(row, "libelle_departement"),
                insee_code,
            },
            coordinates,
            contact: Contact {
                phone: owned_text(row, "telephone"),
                email: owned_text(row, "mail"),
                website: owned_text(row, "web"),
            },
            student_count: row.integer("nombre_d_eleves"),
            ips: None,
            enrollment: None,
            class_size: None,
            estimated_class_size: None,
            exam_results: None,
            languages: None,
            sources: Vec::new(),
        })
    }

    /// Fill `address.insee_code` from the resolver when the directory had none
    pub fn resolve_insee(&mut self, mapping: &InseeMapping) -> bool {
        if self.address.insee_code.is_some() {
            return false;
        }
        let (Some(postal), Some(city)) = (&self.address.postal_code, &self.address.city) else {
            return false;
        };
        match mapping.get(&location_key(postal, city)) {
            Some(resolved) => {
                self.address.insee_code = Some(resolved.insee_code.clone());
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// ATTACHERS
// ============================================================================

const IPS_VALUE_FIELDS: &[&str] = &["ips", "ips_ensemble_gt_pro", "ips_etab"];
const IPS_STD_DEV_FIELDS: &[&str] = &["ecart_type_de_l_ips", "ecart_type_etablissement"];
const STUDENT_COUNT_FIELDS: &[&str] = &["nombre_total_eleves", "nombre_d_eleves", "nombre_eleves_total"];
const CLASS_COUNT_FIELDS: &[&str] = &["nombre_total_classes", "nombre_de_classes"];

fn ips_value(row: &NormalizedRow) -> Option<IpsValue> {
    match row.coalesce(IPS_VALUE_FIELDS)? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(IpsValue::Score),
        Value::String(s) => Some(match crate::normalizer::parse_french_decimal(s) {
            Some(score) => IpsValue::Score(score),
            None => IpsValue::Label(s.trim().to_string()),
        }),
        _ => None,
    }
}

pub fn attach_ips(school: &mut School, row: &NormalizedRow) -> bool {
    let (Some(year), Some(value)) = (row.year("rentree_scolaire"), ips_value(row)) else {
        return false;
    };

    school.ips = Some(IpsRecord {
        value,
        year,
        ecart_type: row.number_of(IPS_STD_DEV_FIELDS),
        national_average: row.number("ips_national"),
        academique_average: row.number("ips_academique"),
        departemental_average: row.number("ips_departemental"),
    });
    true
}

pub fn attach_enrollment(school: &mut School, row: &NormalizedRow) -> bool {
    let Some(year) = row.year("rentree_scolaire") else {
        return false;
    };

    let enrollment = Enrollment {
        year,
        student_count: row.integer_of(STUDENT_COUNT_FIELDS),
        number_of_classes: row.integer_of(CLASS_COUNT_FIELDS),
    };
    if enrollment.student_count.is_none() && enrollment.number_of_classes.is_none() {
        return false;
    }

    school.enrollment = Some(enrollment);
    true
}

pub fn attach_brevet(school: &mut School, row: &NormalizedRow) -> bool {
    let Some(year) = row.year("session") else {
        return false;
    };

    school.exam_results = Some(ExamResults::Brevet(BrevetResults {
        year,
        success_rate: row.number("taux_de_reussite"),
        students_registered: row.integer("inscrits"),
        students_present: row.integer("presents"),
        students_admitted: row.integer("admis"),
        mentions: Mentions {
            sans_mention: row.integer("admis_sans_mention"),
            assez_bien: row.integer("nombre_d_admis_mention_ab"),
            bien: row.integer("admis_mention_bien"),
            tres_bien: row.integer("admis_mention_tres_bien"),
        },
    }));
    true
}

pub fn attach_bac(school: &mut School, row: &NormalizedRow) -> bool {
    let Some(year) = row.year("annee") else {
        return false;
    };

    school.exam_results = Some(ExamResults::Bac(BacResults {
        year,
        success_rate: row.number("taux_reu_total"),
        access_rate_2nde: row.number("taux_acces_2nde"),
        access_rate_1ere: row.number("taux_acces_1ere"),
        access_rate_term: row.number("taux_acces_term"),
        value_added_success: row.number("va_reu_total"),
        value_added_access_2nde: row.number("va_acces_2nde"),
        students_2nde: row.integer("eff_2nde"),
        students_1ere: row.integer("eff_1ere"),
        students_term: row.integer("eff_term"),
        students_present: row.integer("presents_total"),
    }));
    true
}

pub fn attach_languages(school: &mut School, offering: &LanguageOffering) -> bool {
    if offering.year.trim().is_empty() || offering.all_languages.is_empty() {
        return false;
    }
    school.languages = Some(offering.clone());
    true
}

// ============================================================================
// DERIVED METRICS
// ============================================================================

/// (minimum number of grades, assumed pupils per class)
pub fn class_assumptions(school_type: SchoolType) -> Option<(i64, i64)> {
    match school_type {
        SchoolType::Primary => Some((5, 25)),
        SchoolType::MiddleSchool => Some((4, 28)),
        SchoolType::HighSchool => Some((3, 30)),
        SchoolType::Unknown => None,
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// students / classes, rounded to one decimal
pub fn measured_class_size(students: i64, classes: i64) -> Option<f64> {
    if classes <= 0 || students < 0 {
        return None;
    }
    Some(round1(students as f64 / classes as f64))
}

/// students / max(min_grades, students / assumed_size)
pub fn estimated_class_size(school_type: SchoolType, students: i64) -> Option<f64> {
    let (min_grades, assumed) = class_assumptions(school_type)?;
    if students <= 0 {
        return None;
    }
    let classes = (students / assumed).max(min_grades);
    Some(round1(students as f64 / classes as f64))
}

/// Measured class size when both counts are known, otherwise the estimate
pub fn apply_class_metrics(school: &mut School) {
    school.class_size = None;
    school.estimated_class_size = None;

    if let Some(Enrollment {
        student_count: Some(students),
        number_of_classes: Some(classes),
        ..
    }) = &school.enrollment
    {
        if let Some(size) = measured_class_size(*students, *classes) {
            school.class_size = Some(size);
            return;
        }
    }

    let enrolled = school
        .enrollment
        .as_ref()
        .and_then(|e| e.student_count)
        .or(school.student_count);

    let students = match (&school.school_type, &school.exam_results) {
        (SchoolType::HighSchool, Some(ExamResults::Bac(bac))) if bac.grade_total() > 0 => Some(bac.grade_total()),
        _ => enrolled,
    };

    school.estimated_class_size = students.and_then(|s| estimated_class_size(school.school_type, s));
}

// ============================================================================
// CAMPUS PREFERENCE
// ============================================================================

/// Picks the main site among directory rows sharing a UAI.
///
/// Order: name without satellite keyword, then shorter name, then name.
#[derive(Debug, Clone)]
pub struct CampusPreference {
    keywords: Vec<String>,
}

impl CampusPreference {
    pub fn new(keywords: &[String]) -> Self {
        CampusPreference {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    /// Case-insensitive substring match on any keyword
    fn is_satellite(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.keywords.iter().any(|k| !k.is_empty() && lower.contains(k.as_str()))
    }

    fn rank<'n>(&self, name: &'n str) -> (bool, usize, &'n str) {
        (self.is_satellite(name), name.chars().count(), name)
    }
}

impl Priority<NormalizedRow> for CampusPreference {
    fn choose(&self, existing: &NormalizedRow, candidate: &NormalizedRow) -> Choice {
        let old = existing.text("nom_etablissement").unwrap_or("");
        let new = candidate.text("nom_etablissement").unwrap_or("");
        if self.rank(new) < self.rank(old) {
            debug!(kept = new, dropped = old, "campus row replaced by main site");
            Choice::TakeCandidate
        } else {
            Choice::KeepExisting
        }
    }
}

// ============================================================================
// ASSEMBLY
// ============================================================================

/// Reconciled side tables, each optional
#[derive(Default)]
pub struct SchoolTables<'a> {
    pub ips_ecoles: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub ips_colleges: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub ips_lycees: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub enrollment_ecoles: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub enrollment_colleges: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub enrollment_lycees: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub brevet: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub bac: Option<&'a BTreeMap<EntityKey, NormalizedRow>>,
    pub languages: Option<&'a BTreeMap<EntityKey, LanguageOffering>>,
}

impl<'a> SchoolTables<'a> {
    pub fn joiner(&self) -> Joiner<'a, School> {
        use SchoolType::*;
        let only = |t: SchoolType| Applicability::Only(vec![t]);

        Joiner::new()
            .with_table(KeyedTable::new("ips", datasets::IPS_ECOLES, only(Primary), self.ips_ecoles, attach_ips))
            .with_table(KeyedTable::new("ips", datasets::IPS_COLLEGES, only(MiddleSchool), self.ips_colleges, attach_ips))
            .with_table(KeyedTable::new("ips", datasets::IPS_LYCEES, only(HighSchool), self.ips_lycees, attach_ips))
            .with_table(KeyedTable::new(
                "enrollment",
                datasets::ENROLLMENT_ECOLES,
                only(Primary),
                self.enrollment_ecoles,
                attach_enrollment,
            ))
            .with_table(KeyedTable::new(
                "enrollment",
                datasets::ENROLLMENT_COLLEGES,
                only(MiddleSchool),
                self.enrollment_colleges,
                attach_enrollment,
            ))
            .with_table(KeyedTable::new(
                "enrollment",
                datasets::ENROLLMENT_LYCEES,
                only(HighSchool),
                self.enrollment_lycees,
                attach_enrollment,
            ))
            .with_table(KeyedTable::new("exam_results", datasets::BREVET, only(MiddleSchool), self.brevet, attach_brevet))
            .with_table(KeyedTable::new("exam_results", datasets::BAC, only(HighSchool), self.bac, attach_bac))
            .with_table(KeyedTable::new(
                "languages",
                datasets::LANGUAGES,
                Applicability::Only(vec![MiddleSchool, HighSchool]),
                self.languages,
                attach_languages,
            ))
    }
}

/// Build every school: base filter, side tables, INSEE resolution, metrics
pub fn assemble_schools(
    directory: &BTreeMap<EntityKey, NormalizedRow>,
    tables: &SchoolTables<'_>,
    rules: &SchoolRules,
    insee: Option<&InseeMapping>,
) -> JoinReport<School> {
    let mut dropped = 0;
    let bases: Vec<School> = directory
        .values()
        .filter(|row| {
            let school_type = rules.classify(row);
            rules.include_in_scope(row, school_type)
        })
        .filter_map(|row| {
            let school = School::from_directory(row, rules);
            if school.is_none() {
                dropped += 1;
            }
            school
        })
        .collect();

    info!(bases = bases.len(), dropped, "school bases built");

    let mut report = tables.joiner().join(bases);

    for school in report.entities.iter_mut() {
        if let Some(mapping) = insee {
            school.resolve_insee(mapping);
        }
        apply_class_metrics(school);
    }

    report
}

// ============================================================================
// TESTS
// ============================================================================

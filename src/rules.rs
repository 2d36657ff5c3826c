// 🏷️ Categorization Rules - Rules as Data
// Marker rules that classify directory rows and decide what is in scope

use crate::normalizer::NormalizedRow;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SCHOOL TYPE
// ============================================================================

/// Level of a school. Serialized with the labels the map front end expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchoolType {
    #[serde(rename = "Primaire")]
    Primary,

    #[serde(rename = "Collège")]
    MiddleSchool,

    #[serde(rename = "Lycée")]
    HighSchool,

    #[serde(rename = "Unknown")]
    Unknown,
}

impl SchoolType {
    pub fn label(&self) -> &'static str {
        match self {
            SchoolType::Primary => "Primaire",
            SchoolType::MiddleSchool => "Collège",
            SchoolType::HighSchool => "Lycée",
            SchoolType::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, SchoolType::Unknown)
    }
}

impl fmt::Display for SchoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRule {
    pub school_type: SchoolType,

    /// Substrings searched case-insensitively in the type and nature labels
    pub markers: Vec<String>,

    /// Higher = tried first
    #[serde(default)]
    pub priority: i32,
}

impl TypeRule {
    pub fn new(school_type: SchoolType, markers: &[&str], priority: i32) -> Self {
        TypeRule {
            school_type,
            markers: markers.iter().map(|m| m.to_string()).collect(),
            priority,
        }
    }

    /// True when any marker occurs in `text` (case-insensitive)
    pub fn matches(&self, text: &str) -> bool {
        let text_lower = text.to_lowercase();
        self.markers
            .iter()
            .any(|m| !m.is_empty() && text_lower.contains(&m.to_lowercase()))
    }
}

/// Which high-school tracks count as general curriculum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPolicy {
    /// voie_generale only
    #[default]
    GeneralOnly,

    /// voie_generale or voie_technologique
    GeneralOrTechnological,
}

/// Marker configuration, loadable from the pipeline config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierMarkers {
    pub primary: Vec<String>,
    pub middle_school: Vec<String>,
    pub high_school: Vec<String>,

    /// Any of these in the nature label or the name excludes a high school
    pub professional: Vec<String>,
}

impl Default for ClassifierMarkers {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        ClassifierMarkers {
            primary: owned(&["ecole", "école"]),
            middle_school: owned(&["collège", "college"]),
            high_school: owned(&["lycée", "lycee"]),
            professional: owned(&["professionnel"]),
        }
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct SchoolRules {
    rules: Vec<TypeRule>,
    professional_markers: Vec<String>,
    policy: TrackPolicy,
}

impl SchoolRules {
    pub fn new(markers: &ClassifierMarkers, policy: TrackPolicy) -> Self {
        let mut rules = vec![
            TypeRule {
                school_type: SchoolType::Primary,
                markers: markers.primary.clone(),
                priority: 30,
            },
            TypeRule {
                school_type: SchoolType::MiddleSchool,
                markers: markers.middle_school.clone(),
                priority: 20,
            },
            TypeRule {
                school_type: SchoolType::HighSchool,
                markers: markers.high_school.clone(),
                priority: 10,
            },
        ];
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        SchoolRules {
            rules,
            professional_markers: markers.professional.iter().map(|m| m.to_lowercase()).collect(),
            policy,
        }
    }

    /// First matching rule over `type_etablissement` and `libelle_nature`
    pub fn classify(&self, row: &NormalizedRow) -> SchoolType {
        let type_label = row.text("type_etablissement").unwrap_or("");
        let nature = row.text("libelle_nature").unwrap_or("");

        for rule in &self.rules {
            if rule.matches(type_label) || rule.matches(nature) {
                return rule.school_type;
            }
        }

        SchoolType::Unknown
    }

    /// Whether `text` carries a professional-track marker
    pub fn is_professional(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.professional_markers.iter().any(|m| lower.contains(m.as_str()))
    }

    /// General-curriculum scope filter
    pub fn include_in_scope(&self, row: &NormalizedRow, school_type: SchoolType) -> bool {
        match school_type {
            // nursery-only schools have no elementary level
            SchoolType::Primary => row.flag("ecole_elementaire") == Some(true),
            SchoolType::MiddleSchool => true,
            SchoolType::HighSchool => self.high_school_in_scope(row),
            SchoolType::Unknown => false,
        }
    }

    fn high_school_in_scope(&self, row: &NormalizedRow) -> bool {
        let nature = row.text("libelle_nature").unwrap_or("");
        let name = row.text("nom_etablissement").unwrap_or("");
        if self.is_professional(nature) || self.is_professional(name) {
            return false;
        }

        let general = row.flag("voie_generale");
        let professional = row.flag("voie_professionnelle");

        if general == Some(true) {
            return true;
        }
        if general.is_none() && professional.is_none() {
            return true;
        }

        self.policy == TrackPolicy::GeneralOrTechnological && row.flag("voie_technologique") == Some(true)
    }
}

impl Default for SchoolRules {
    fn default() -> Self {
        Self::new(&ClassifierMarkers::default(), TrackPolicy::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

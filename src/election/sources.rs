// 🗳️ Election Sources - per-export reading declarations
// Every export differs in delimiter, encoding, headers and code convention,
// so each one carries its own settings.

use crate::csv_source::{CsvFormat, TextEncoding};
use crate::reconciler::EntityKey;
use crate::normalizer::NormalizedRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionKind {
    Municipal,
    Presidential,
    Legislative,
}

/// Row shape of a results export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowLayout {
    /// One row per candidate (or list)
    #[default]
    Long,

    /// One row per commune with numbered candidate column groups
    Wide,
}

/// How the INSEE code is spelled in the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommuneCodeConvention {
    /// The commune column already holds the 5-digit code
    Full,

    /// Department column + commune-local column
    #[default]
    DepartmentPlusLocal,
}

/// Which runoff candidates carry a vote count
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RunoffShape {
    #[default]
    AllCandidates,

    /// Only the leader's votes are present; the trailer gets the remainder
    /// of the expressed votes
    LeaderOnly { trailing_candidate: String },
}

/// Header names for the canonical fields of a results export.
///
/// For `RowLayout::Wide` the candidate headers contain `{n}`, replaced by the
/// slot number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionColumns {
    pub department: String,
    pub commune: String,
    pub commune_name: String,
    pub expressed: String,

    /// Sub-commune unit whose expressed count is summed (polling station,
    /// constituency)
    pub subkey: Option<String>,

    pub last_name: String,
    pub first_name: String,
    pub party: String,

    /// Municipal list name
    pub list_label: Option<String>,

    pub votes: String,
}

impl Default for ElectionColumns {
    fn default() -> Self {
        ElectionColumns {
            department: "Code du département".to_string(),
            commune: "Code de la commune".to_string(),
            commune_name: "Libellé de la commune".to_string(),
            expressed: "Exprimés".to_string(),
            subkey: None,
            last_name: "Nom".to_string(),
            first_name: "Prénom".to_string(),
            party: "Nuance".to_string(),
            list_label: None,
            votes: "Voix".to_string(),
        }
    }
}

impl ElectionColumns {
    pub fn slot(template: &str, n: usize) -> String {
        template.replace("{n}", &n.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionSource {
    pub id: String,
    pub kind: ElectionKind,
    pub round: u8,
    pub year: String,
    pub url: String,

    #[serde(default)]
    pub format: CsvFormat,

    #[serde(default)]
    pub layout: RowLayout,

    #[serde(default)]
    pub commune_code: CommuneCodeConvention,

    #[serde(default)]
    pub columns: ElectionColumns,

    #[serde(default)]
    pub runoff: RunoffShape,
}

impl ElectionSource {
    pub fn is_runoff(&self) -> bool {
        self.round >= 2
    }

    /// Department of a row, normalized ("017" → "17", "1" → "01")
    pub fn department_of(&self, row: &NormalizedRow) -> Option<String> {
        if let Some(raw) = row.text(&self.columns.department) {
            return Some(normalize_department(raw));
        }
        match self.commune_code {
            CommuneCodeConvention::Full => row
                .text(&self.columns.commune)
                .map(str::trim)
                .filter(|code| code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|code| code.get(..2))
                .map(str::to_string),
            CommuneCodeConvention::DepartmentPlusLocal => None,
        }
    }

    /// INSEE key of a row per the declared convention
    pub fn commune_key(&self, row: &NormalizedRow) -> Option<EntityKey> {
        let commune = row.text(&self.columns.commune)?;
        match self.commune_code {
            CommuneCodeConvention::Full => EntityKey::insee(commune),
            CommuneCodeConvention::DepartmentPlusLocal => {
                let department = normalize_department(row.text(&self.columns.department)?);
                let local = pad_digits(commune, 3)?;
                EntityKey::insee(&format!("{}{}", department, local))
            }
        }
    }
}

/// Zero-pad a purely numeric department code to 2; strip extra leading zeros
pub fn normalize_department(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        match trimmed.parse::<u32>() {
            Ok(n) => format!("{:02}", n),
            Err(_) => trimmed.to_string(),
        }
    } else {
        trimmed.to_uppercase()
    }
}

fn pad_digits(raw: &str, width: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) || trimmed.len() > width {
        return None;
    }
    Some(format!("{:0>width$}", trimmed, width = width))
}

// ============================================================================
// DEFAULT SOURCES
// ============================================================================

/// Mayors export from the national register of elected officials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MayorSource {
    pub url: String,
    pub year: String,
    pub format: CsvFormat,

    /// Exact value of the function column for a mayor
    pub function: String,
}

impl Default for MayorSource {
    fn default() -> Self {
        let format = CsvFormat::new(';', TextEncoding::Utf8)
            .with_column("code_commune", "Code de la commune")
            .with_column("code_departement", "Code du département")
            .with_column("fonction", "Nom de la fonction")
            .with_column("prenom", "Prénom de l'élu·e")
            .with_column("nom", "Nom de l'élu·e");

        MayorSource {
            url: "https://public.opendatasoft.com/api/explore/v2.1/catalog/datasets/donnees-du-repertoire-national-des-elus/exports/csv/?delimiters=%3B&lang=en&timezone=UTC&use_labels=true".to_string(),
            year: "2024".to_string(),
            format,
            function: "Maire".to_string(),
        }
    }
}

pub fn default_sources() -> Vec<ElectionSource> {
    let latin1 = CsvFormat {
        delimiter: ';',
        encoding: TextEncoding::Latin1,
        strip_bom: false,
        columns: BTreeMap::new(),
    };

    let municipal_columns = ElectionColumns {
        party: "Nuance Liste".to_string(),
        list_label: Some("Libellé de liste".to_string()),
        ..Default::default()
    };

    let presidential_columns = ElectionColumns {
        subkey: Some("Code du b.vote".to_string()),
        ..Default::default()
    };

    let legislative_columns = ElectionColumns {
        department: "Code département".to_string(),
        commune: "Code commune".to_string(),
        commune_name: "Libellé commune".to_string(),
        expressed: "Exprimés".to_string(),
        // communes split across constituencies have one row per constituency
        subkey: Some("Code circonscription législative".to_string()),
        last_name: "Nom candidat {n}".to_string(),
        first_name: "Prénom candidat {n}".to_string(),
        party: "Nuance candidat {n}".to_string(),
        list_label: None,
        votes: "Voix {n}".to_string(),
    };

    let source = |id: &str, kind, round, year: &str, url: &str| ElectionSource {
        id: id.to_string(),
        kind,
        round,
        year: year.to_string(),
        url: url.to_string(),
        format: latin1.clone(),
        layout: RowLayout::Long,
        commune_code: CommuneCodeConvention::DepartmentPlusLocal,
        columns: ElectionColumns::default(),
        runoff: RunoffShape::AllCandidates,
    };

    vec![
        ElectionSource {
            columns: municipal_columns.clone(),
            ..source(
                "municipal_2020_small_communes",
                ElectionKind::Municipal,
                2,
                "2020",
                "https://www.data.gouv.fr/api/1/datasets/r/7a5faf5f-7e3b-4de6-9f1d-a8e3ad176476",
            )
        },
        ElectionSource {
            columns: municipal_columns,
            ..source(
                "municipal_2020_large_communes",
                ElectionKind::Municipal,
                2,
                "2020",
                "https://www.data.gouv.fr/api/1/datasets/r/e7cae0aa-5e36-4370-b724-6f233014d0d6",
            )
        },
        ElectionSource {
            columns: presidential_columns.clone(),
            ..source(
                "presidential_2022_round_1",
                ElectionKind::Presidential,
                1,
                "2022",
                "https://www.data.gouv.fr/api/1/datasets/r/68b19a8d-5921-4d49-a0c7-b9241ddce9e6",
            )
        },
        ElectionSource {
            columns: presidential_columns,
            ..source(
                "presidential_2022_round_2",
                ElectionKind::Presidential,
                2,
                "2022",
                "https://www.data.gouv.fr/api/1/datasets/r/c700bcf1-5d88-4da6-b998-094587a90444",
            )
        },
        ElectionSource {
            layout: RowLayout::Wide,
            commune_code: CommuneCodeConvention::Full,
            columns: legislative_columns.clone(),
            ..source(
                "legislative_2024_round_1",
                ElectionKind::Legislative,
                1,
                "2024",
                "https://www.data.gouv.fr/api/1/datasets/r/bd32fcd3-53df-47ac-bf1d-8d8003fe23a1",
            )
        },
        ElectionSource {
            layout: RowLayout::Wide,
            commune_code: CommuneCodeConvention::Full,
            columns: legislative_columns,
            ..source(
                "legislative_2024_round_2",
                ElectionKind::Legislative,
                2,
                "2024",
                "https://www.data.gouv.fr/api/1/datasets/r/5a8088fd-8168-402a-9f40-c48daab88cd1",
            )
        },
    ]
}

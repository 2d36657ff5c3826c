// 🎨 Party Labels - nuance code → human label
// Static table, extended or overridden from configuration.

use std::collections::BTreeMap;

const STATIC_LABELS: &[(&str, &str)] = &[
    // municipal list nuances
    ("LDVD", "Divers droite"),
    ("LDVG", "Divers gauche"),
    ("LDVC", "Divers centre"),
    ("LUG", "Union de la gauche"),
    ("LUD", "Union de la droite"),
    ("LUC", "Union du centre"),
    ("LVEC", "Écologiste"),
    ("LECO", "Écologiste"),
    ("LREM", "Renaissance (ex-LREM)"),
    ("LMDM", "MoDem"),
    ("LUDI", "Union des démocrates et indépendants"),
    ("LLR", "Les Républicains"),
    ("LRN", "Rassemblement national"),
    ("LSOC", "Socialiste"),
    ("LCOM", "Communiste"),
    ("LFI", "La France insoumise"),
    ("LEXG", "Extrême gauche"),
    ("LEXD", "Extrême droite"),
    ("LDIV", "Divers"),
    ("LREG", "Régionaliste"),
    ("LNC", "Non classé"),
    ("NC", "Non classé"),
    // legislative nuances
    ("UG", "Union de la gauche"),
    ("ENS", "Ensemble"),
    ("RN", "Rassemblement national"),
    ("UXD", "Union de l'extrême droite"),
    ("LR", "Les Républicains"),
    ("DVD", "Divers droite"),
    ("DVG", "Divers gauche"),
    ("DVC", "Divers centre"),
    ("ECO", "Écologiste"),
    ("SOC", "Socialiste"),
    ("HOR", "Horizons"),
    ("REC", "Reconquête"),
    ("EXG", "Extrême gauche"),
    ("EXD", "Extrême droite"),
    ("REG", "Régionaliste"),
    ("DIV", "Divers"),
];

/// Code → label lookup. Unknown codes are returned unchanged.
#[derive(Debug, Clone)]
pub struct PartyLabels {
    labels: BTreeMap<String, String>,
}

impl PartyLabels {
    /// Static table with `overrides` applied on top
    pub fn new(overrides: &BTreeMap<String, String>) -> Self {
        let mut labels: BTreeMap<String, String> = STATIC_LABELS
            .iter()
            .map(|(code, label)| (code.to_string(), label.to_string()))
            .collect();

        for (code, label) in overrides {
            labels.insert(code.trim().to_uppercase(), label.clone());
        }

        PartyLabels { labels }
    }

    pub fn label<'a>(&'a self, code: &'a str) -> &'a str {
        let trimmed = code.trim();
        self.labels
            .get(&trimmed.to_uppercase())
            .map(|s| s.as_str())
            .unwrap_or(trimmed)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for PartyLabels {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

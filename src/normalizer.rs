// 🧹 Row Normalizer - envelope-free field maps
// Every source row, JSON or CSV, ends up as a flat NormalizedRow

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque row as returned by one upstream source.
pub type RawRow = Value;

// ============================================================================
// NORMALIZED ROW
// ============================================================================

/// Flat field name → value map, one per upstream row.
///
/// Absent optional fields stay absent; accessors return `None` for them and
/// for JSON null or empty strings alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedRow {
    fields: Map<String, Value>,
}

impl NormalizedRow {
    pub fn new() -> Self {
        NormalizedRow { fields: Map::new() }
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        NormalizedRow { fields }
    }

    /// Builder used by CSV readers and tests
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Raw value, with null and "" treated as absent
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v),
        }
    }

    /// First present value among a prioritized list of field names.
    ///
    /// Used where upstream schema variants name the same value differently.
    pub fn coalesce(&self, candidates: &[&str]) -> Option<&Value> {
        candidates.iter().find_map(|field| self.get(field))
    }

    /// String value (trimmed); numbers are not stringified here
    pub fn text(&self, field: &str) -> Option<&str> {
        match self.get(field)? {
            Value::String(s) => Some(s.trim()),
            _ => None,
        }
    }

    /// Numeric value; accepts JSON numbers and French-formatted strings
    /// ("94,20%", "1 234,5")
    pub fn number(&self, field: &str) -> Option<f64> {
        value_as_f64(self.get(field)?)
    }

    pub fn number_of(&self, candidates: &[&str]) -> Option<f64> {
        candidates.iter().find_map(|field| self.number(field))
    }

    /// Integer value; floats with a fractional part are rejected
    pub fn integer(&self, field: &str) -> Option<i64> {
        value_as_i64(self.get(field)?)
    }

    pub fn integer_of(&self, candidates: &[&str]) -> Option<i64> {
        candidates.iter().find_map(|field| self.integer(field))
    }

    /// Boolean flag: true/false, 1/0, "1"/"0", "oui"/"non"
    pub fn flag(&self, field: &str) -> Option<bool> {
        match self.get(field)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "1" | "true" | "oui" | "o" | "yes" => Some(true),
                "0" | "false" | "non" | "n" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Year/session as a comparable string ("2023-2024", "2022")
    pub fn year(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Parse numbers the way French open-data exports write them
pub fn parse_french_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_french_decimal(s),
        _ => None,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let f = parse_french_decimal(s)?;
            if f.fract() == 0.0 {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

// ============================================================================
// ROW SCHEMA
// ============================================================================

/// How a source lays out its rows. Chosen once per dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowSchema {
    /// Fields at the top level of each row
    Flat,

    /// Fields nested under an envelope, e.g. `{record: {fields: {...}}}`
    Envelope { path: Vec<String> },
}

impl RowSchema {
    /// The Opendatasoft v2 catalog layout
    pub fn record_fields() -> Self {
        RowSchema::Envelope {
            path: vec!["record".to_string(), "fields".to_string()],
        }
    }

    /// Extract the field map; `None` when no object is reachable
    pub fn normalize(&self, raw: &RawRow) -> Option<NormalizedRow> {
        let mut current = raw;

        if let RowSchema::Envelope { path } = self {
            for step in path {
                current = current.as_object()?.get(step)?;
            }
        }

        current
            .as_object()
            .map(|fields| NormalizedRow::from_map(fields.clone()))
    }

    /// Normalize a whole page, discarding rows with no extractable map
    pub fn normalize_all(&self, raws: &[RawRow]) -> Vec<NormalizedRow> {
        raws.iter().filter_map(|raw| self.normalize(raw)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_unwraps_one_level() {
        let raw = json!({
            "links": [],
            "record": { "id": "x", "fields": { "uai": "0440021J", "ips": 104.2 } }
        });

        let row = RowSchema::record_fields().normalize(&raw).unwrap();
        assert_eq!(row.text("uai"), Some("0440021J"));
        assert_eq!(row.number("ips"), Some(104.2));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_envelope_missing_returns_none() {
        let raw = json!({ "uai": "0440021J" });
        assert!(RowSchema::record_fields().normalize(&raw).is_none());
    }

    #[test]
    fn test_flat_row_used_as_is() {
        let raw = json!({ "uai": "0440021J" });
        let row = RowSchema::Flat.normalize(&raw).unwrap();
        assert_eq!(row.text("uai"), Some("0440021J"));

        assert!(RowSchema::Flat.normalize(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_absent_and_empty_fields() {
        let row = NormalizedRow::new()
            .with("empty", "  ")
            .with("null", Value::Null)
            .with("name", "Ecole Jules Ferry");

        assert!(row.get("empty").is_none());
        assert!(row.get("null").is_none());
        assert!(row.get("missing").is_none());
        assert_eq!(row.coalesce(&["missing", "empty", "name"]), Some(&json!("Ecole Jules Ferry")));
    }

    #[test]
    fn test_french_decimal() {
        assert_eq!(parse_french_decimal("94,20%"), Some(94.2));
        assert_eq!(parse_french_decimal("1 234,5"), Some(1234.5));
        assert_eq!(parse_french_decimal("NS"), None);
        assert_eq!(parse_french_decimal(""), None);
    }

    #[test]
    fn test_flags_and_integers() {
        let row = NormalizedRow::new()
            .with("ecole_elementaire", 1)
            .with("voie_generale", "0")
            .with("eleves", "250")
            .with("ratio", 2.5);

        assert_eq!(row.flag("ecole_elementaire"), Some(true));
        assert_eq!(row.flag("voie_generale"), Some(false));
        assert_eq!(row.flag("voie_professionnelle"), None);
        assert_eq!(row.integer("eleves"), Some(250));
        assert_eq!(row.integer("ratio"), None);
    }

    #[test]
    fn test_year_stringifies_numbers() {
        let row = NormalizedRow::new().with("annee", 2023).with("session", "2022-2023");
        assert_eq!(row.year("annee"), Some("2023".to_string()));
        assert_eq!(row.year("session"), Some("2022-2023".to_string()));
    }
}

// 📄 CSV Source - declared encoding/delimiter readers for CSV exports
// Electoral and RNE exports are not served through the paginated API

use crate::normalizer::NormalizedRow;
use anyhow::{Context, Result};
use encoding_rs::{UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Byte encoding of an export. Latin1 files are decoded as Windows-1252,
/// its superset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

/// How to read one CSV export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvFormat {
    /// Single-byte field delimiter, usually ';' or ','
    pub delimiter: char,

    pub encoding: TextEncoding,

    /// Drop a leading U+FEFF before parsing
    pub strip_bom: bool,

    /// Canonical name → header as it appears in the export.
    /// Empty means raw headers are used as field names.
    pub columns: BTreeMap<String, String>,
}

impl Default for CsvFormat {
    fn default() -> Self {
        CsvFormat {
            delimiter: ';',
            encoding: TextEncoding::Utf8,
            strip_bom: true,
            columns: BTreeMap::new(),
        }
    }
}

impl CsvFormat {
    pub fn new(delimiter: char, encoding: TextEncoding) -> Self {
        CsvFormat {
            delimiter,
            encoding,
            ..Default::default()
        }
    }

    pub fn with_column(mut self, canonical: &str, header: &str) -> Self {
        self.columns.insert(canonical.to_string(), header.to_string());
        self
    }

    /// Decode raw bytes to text per the declared encoding
    pub fn decode(&self, bytes: &[u8]) -> String {
        let encoding = match self.encoding {
            TextEncoding::Utf8 => UTF_8,
            TextEncoding::Latin1 => WINDOWS_1252,
        };
        let (text, _, had_errors) = encoding.decode(bytes);
        if had_errors {
            debug!(encoding = ?self.encoding, "replacement characters inserted while decoding");
        }

        let mut text = text.into_owned();
        if self.strip_bom && text.starts_with('\u{feff}') {
            text.remove(0);
        }
        text.retain(|c| c != '\0');
        text
    }

    /// Parse every record to a NormalizedRow keyed by canonical column name
    pub fn read_rows(&self, bytes: &[u8]) -> Result<Vec<NormalizedRow>> {
        let text = self.decode(bytes);
        let delimiter = u8::try_from(self.delimiter)
            .with_context(|| format!("delimiter {:?} is not a single byte", self.delimiter))?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        // header position → field name
        let names: Vec<(usize, String)> = if self.columns.is_empty() {
            headers.iter().cloned().enumerate().collect()
        } else {
            self.columns
                .iter()
                .filter_map(|(canonical, header)| {
                    headers
                        .iter()
                        .position(|h| h == header)
                        .map(|idx| (idx, canonical.clone()))
                })
                .collect()
        };

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Malformed CSV record at row {}", line + 2))?;
            let mut row = NormalizedRow::new();
            for (idx, name) in &names {
                if let Some(value) = record.get(*idx) {
                    let value = value.trim();
                    if !value.is_empty() {
                        row.insert(name, value);
                    }
                }
            }
            rows.push(row);
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bom_stripped_and_headers_mapped() {
        let bytes = "\u{feff}Code de la commune;Libellé de la fonction;Nom de l'élu\n44109;Maire;Rolland\n".as_bytes();
        let format = CsvFormat::new(';', TextEncoding::Utf8)
            .with_column("code_commune", "Code de la commune")
            .with_column("fonction", "Libellé de la fonction");

        let rows = format.read_rows(bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("code_commune"), Some("44109"));
        assert_eq!(rows[0].text("fonction"), Some("Maire"));
        // unmapped columns are not carried
        assert_eq!(rows[0].len(), 2);
    }

    #[test]
    fn test_latin1_decoding() {
        // "Libellé" with é as 0xE9
        let mut bytes = b"Libell".to_vec();
        bytes.push(0xE9);
        bytes.extend_from_slice(b",Voix\nNantes,12\n");

        let rows = CsvFormat::new(',', TextEncoding::Latin1).read_rows(&bytes).unwrap();
        assert_eq!(rows[0].text("Libellé"), Some("Nantes"));
        assert_eq!(rows[0].integer("Voix"), Some(12));
    }

    #[test]
    fn test_empty_values_and_ragged_rows_are_absent() {
        let bytes = b"a;b;c\n1;;3\n4\n";
        let rows = CsvFormat::default().read_rows(bytes).unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("b").is_none());
        assert_eq!(rows[0].text("c"), Some("3"));
        assert!(rows[1].get("c").is_none());
    }

    #[test]
    fn test_nul_bytes_removed() {
        let bytes = b"a;b\n1\0;2\n";
        let rows = CsvFormat::default().read_rows(bytes).unwrap();
        assert_eq!(rows[0].text("a"), Some("1"));
    }

    #[test]
    fn test_missing_mapped_column_is_not_an_error() {
        let bytes = b"a;b\n1;2\n";
        let format = CsvFormat::default().with_column("x", "missing header");
        let rows = format.read_rows(bytes).unwrap();
        assert!(rows[0].is_empty());
    }
}

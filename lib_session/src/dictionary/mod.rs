//! # Data Dictionary
//!
//! The field and enum-type dictionaries served on the dictionary domain, and
//! the payload sources that stream them (or any raw byte payload) through the
//! [`MultiPartResponseEncoder`](crate::core::multipart::MultiPartResponseEncoder).
//!
//! A dictionary loads from a JSON file (JSON5 with the `json5` feature) or
//! falls back to a small built-in set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::core::multipart::{MultiPartCursor, PartOutcome, PayloadSource};
use crate::core::registry::{ENUM_DICTIONARY_NAME, FIELD_DICTIONARY_NAME};
use crate::transport::CodecError;

/// Errors raised while loading a dictionary.
#[derive(Debug, Error)]
pub enum DictionaryError {
    /// The file could not be read.
    #[error("failed to read dictionary {path:?}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The text is not a valid dictionary document.
    #[error("failed to parse dictionary: {0}")]
    Parse(String),
    /// Two field definitions share a fid.
    #[error("duplicate field id {0}")]
    DuplicateFid(i16),
}

/// One field definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field id.
    pub fid: i16,
    /// Short name.
    pub acronym: String,
    /// Legacy display name.
    #[serde(default)]
    pub dde_acronym: String,
    /// Wire type name, e.g. `REAL`, `ENUM`, `RMTES_STRING`.
    pub rwf_type: String,
    /// Maximum encoded length.
    #[serde(default)]
    pub length: u16,
}

/// One enumerated value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValue {
    /// Wire value.
    pub value: u16,
    /// Display string.
    pub display: String,
    /// Long description.
    #[serde(default)]
    pub meaning: String,
}

/// Enum values shared by one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumTable {
    /// Fields that use this table.
    pub fids: Vec<i16>,
    /// Values in the table.
    pub values: Vec<EnumValue>,
}

/// Field and enum-type dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDictionary {
    /// Version reported in the dictionary summary.
    #[serde(default = "default_version")]
    pub version: String,
    /// Field definitions.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Enum tables.
    #[serde(default)]
    pub enum_tables: Vec<EnumTable>,
}

fn default_version() -> String {
    "4.20.40".to_string()
}

impl DataDictionary {
    /// Loads a dictionary from `path`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DictionaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dictionary = Self::from_json_str(&text)?;
        log::info!(
            "Loaded dictionary {:?}: {} fields, {} enum tables",
            path,
            dictionary.fields.len(),
            dictionary.enum_tables.len()
        );
        Ok(dictionary)
    }

    /// Parses a dictionary document.
    pub fn from_json_str(text: &str) -> Result<Self, DictionaryError> {
        #[cfg(feature = "json5")]
        let dictionary: DataDictionary =
            json5::from_str(text).map_err(|e| DictionaryError::Parse(e.to_string()))?;
        #[cfg(not(feature = "json5"))]
        let dictionary: DataDictionary =
            serde_json::from_str(text).map_err(|e| DictionaryError::Parse(e.to_string()))?;

        dictionary.validate()?;
        Ok(dictionary)
    }

    fn validate(&self) -> Result<(), DictionaryError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.fid) {
                return Err(DictionaryError::DuplicateFid(field.fid));
            }
        }
        Ok(())
    }

    /// Small dictionary covering the common level-one quote fields.
    pub fn builtin() -> Self {
        let field = |fid: i16, acronym: &str, dde: &str, rwf_type: &str, length: u16| FieldDef {
            fid,
            acronym: acronym.to_string(),
            dde_acronym: dde.to_string(),
            rwf_type: rwf_type.to_string(),
            length,
        };
        let value = |value: u16, display: &str, meaning: &str| EnumValue {
            value,
            display: display.to_string(),
            meaning: meaning.to_string(),
        };

        Self {
            version: default_version(),
            fields: vec![
                field(1, "PROD_PERM", "PERMISSION", "UINT64", 5),
                field(2, "RDNDISPLAY", "RDNDISPLAY", "UINT64", 3),
                field(3, "DSPLY_NAME", "DISPLAY NAME", "RMTES_STRING", 16),
                field(4, "RDN_EXCHID", "IDN EXCHANGE", "ENUM", 3),
                field(6, "TRDPRC_1", "LAST", "REAL64", 17),
                field(11, "NETCHNG_1", "NET.CHNG", "REAL64", 17),
                field(12, "HIGH_1", "TODAYS HIGH", "REAL64", 17),
                field(13, "LOW_1", "TODAYS LOW", "REAL64", 17),
                field(15, "CURRENCY", "CURRENCY", "ENUM", 3),
                field(16, "TRADE_DATE", "TRADE DATE", "DATE", 11),
                field(19, "OPEN_PRC", "OPEN PRICE", "REAL64", 17),
                field(21, "HST_CLOSE", "HIST CLOSE", "REAL64", 17),
                field(22, "BID", "BID", "REAL64", 17),
                field(25, "ASK", "ASK", "REAL64", 17),
                field(30, "BIDSIZE", "BIDSIZE", "REAL64", 17),
                field(31, "ASKSIZE", "ASKSIZE", "REAL64", 17),
                field(32, "ACVOL_1", "VOL ACCUMULATED", "REAL64", 17),
                field(53, "TRD_UNITS", "TRADE UNITS", "ENUM", 2),
                field(267, "ASK_TIME", "ASK TIME", "TIME", 5),
                field(1025, "QUOTIM", "QUOTE TIME", "TIME", 8),
            ],
            enum_tables: vec![
                EnumTable {
                    fids: vec![4],
                    values: vec![
                        value(0, "   ", "Undefined"),
                        value(1, "ASE", "NYSE AMEX"),
                        value(2, "NYS", "New York Stock Exchange"),
                        value(3, "BOS", "Boston Stock Exchange"),
                    ],
                },
                EnumTable {
                    fids: vec![15],
                    values: vec![
                        value(0, "---", "Undefined"),
                        value(124, "CAD", "Canadian dollar"),
                        value(826, "GBP", "UK pound sterling"),
                        value(840, "USD", "US dollar"),
                        value(978, "EUR", "Euro"),
                    ],
                },
                EnumTable {
                    fids: vec![53],
                    values: vec![
                        value(0, "INT ", "Integer"),
                        value(1, "1DP ", "One decimal place"),
                        value(2, "2DP ", "Two decimal places"),
                        value(3, "3DP ", "Three decimal places"),
                    ],
                },
            ],
        }
    }
}

/// Which of the two dictionaries a request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DictionaryKind {
    /// Field definitions.
    Field,
    /// Enum tables.
    Enum,
}

impl DictionaryKind {
    /// Maps a dictionary name to its kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            FIELD_DICTIONARY_NAME => Some(DictionaryKind::Field),
            ENUM_DICTIONARY_NAME => Some(DictionaryKind::Enum),
            _ => None,
        }
    }

    /// Wire name of the dictionary.
    pub fn name(&self) -> &'static str {
        match self {
            DictionaryKind::Field => FIELD_DICTIONARY_NAME,
            DictionaryKind::Enum => ENUM_DICTIONARY_NAME,
        }
    }
}

/// How much of each entry a dictionary refresh carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verbosity {
    /// Summary line only.
    Info,
    /// Ids and names.
    Minimal,
    /// Adds types and lengths.
    Normal,
    /// Adds display names and descriptions.
    Verbose,
}

impl Verbosity {
    /// Decodes the request filter: `0x0` info, `0x3` minimal, `0x7` normal, `0xF` verbose.
    pub fn from_filter(filter: u32) -> Self {
        if filter & 0x8 != 0 {
            Verbosity::Verbose
        } else if filter & 0x4 != 0 {
            Verbosity::Normal
        } else if filter & 0x3 != 0 {
            Verbosity::Minimal
        } else {
            Verbosity::Info
        }
    }
}

/// Streams one dictionary as JSON lines, whole entries per part.
#[derive(Debug)]
pub struct DictionaryPayload {
    lines: Vec<Vec<u8>>,
    next: usize,
    total: usize,
}

impl DictionaryPayload {
    /// Renders the dictionary at the requested verbosity.
    pub fn new(
        dictionary: &DataDictionary,
        kind: DictionaryKind,
        verbosity: Verbosity,
    ) -> Result<Self, CodecError> {
        let count = match kind {
            DictionaryKind::Field => dictionary.fields.len(),
            DictionaryKind::Enum => dictionary.enum_tables.len(),
        };
        let mut entries = vec![json!({
            "name": kind.name(),
            "version": dictionary.version,
            "count": count,
            "verbosity": verbosity,
        })];

        if verbosity > Verbosity::Info {
            match kind {
                DictionaryKind::Field => {
                    entries.extend(dictionary.fields.iter().map(|f| field_entry(f, verbosity)));
                }
                DictionaryKind::Enum => {
                    entries.extend(dictionary.enum_tables.iter().map(|t| enum_entry(t, verbosity)));
                }
            }
        }

        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            lines.push(line);
        }
        let total = lines.iter().map(Vec::len).sum();
        Ok(Self { lines, next: 0, total })
    }

    /// Number of JSON lines, summary included.
    pub fn entry_count(&self) -> usize {
        self.lines.len()
    }
}

fn field_entry(field: &FieldDef, verbosity: Verbosity) -> serde_json::Value {
    let mut entry = json!({ "fid": field.fid, "acronym": field.acronym });
    if verbosity >= Verbosity::Normal {
        entry["type"] = json!(field.rwf_type);
        entry["length"] = json!(field.length);
    }
    if verbosity >= Verbosity::Verbose {
        entry["ddeAcronym"] = json!(field.dde_acronym);
    }
    entry
}

fn enum_entry(table: &EnumTable, verbosity: Verbosity) -> serde_json::Value {
    let values: Vec<serde_json::Value> = table
        .values
        .iter()
        .map(|v| {
            if verbosity >= Verbosity::Verbose {
                json!({ "value": v.value, "display": v.display, "meaning": v.meaning })
            } else {
                json!({ "value": v.value, "display": v.display })
            }
        })
        .collect();
    json!({ "fids": table.fids, "values": values })
}

impl PayloadSource for DictionaryPayload {
    fn total_size(&self) -> usize {
        self.total
    }

    fn encode_part(
        &mut self,
        _cursor: &MultiPartCursor,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<PartOutcome, CodecError> {
        while let Some(line) = self.lines.get(self.next) {
            if out.len() + line.len() > limit {
                if out.is_empty() {
                    return Err(CodecError::EntryTooLarge {
                        size: line.len(),
                        capacity: limit,
                    });
                }
                return Ok(PartOutcome::More);
            }
            out.extend_from_slice(line);
            self.next += 1;
        }
        Ok(PartOutcome::Complete)
    }
}

/// Streams an opaque byte payload, `min(remaining, limit)` bytes per part.
#[derive(Debug, Clone)]
pub struct BytePayload {
    data: Bytes,
}

impl BytePayload {
    /// Wraps the payload bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl PayloadSource for BytePayload {
    fn total_size(&self) -> usize {
        self.data.len()
    }

    fn encode_part(
        &mut self,
        cursor: &MultiPartCursor,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<PartOutcome, CodecError> {
        let start = cursor.bytes_emitted.min(self.data.len());
        let end = self.data.len().min(start + limit);
        out.extend_from_slice(&self.data[start..end]);
        if end == self.data.len() {
            Ok(PartOutcome::Complete)
        } else {
            Ok(PartOutcome::More)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn drain(payload: &mut dyn PayloadSource, limit: usize) -> Vec<Vec<u8>> {
        let mut cursor = MultiPartCursor::new(payload.total_size());
        let mut parts = Vec::new();
        loop {
            let mut out = BytesMut::new();
            let outcome = payload.encode_part(&cursor, &mut out, limit).unwrap();
            cursor.bytes_emitted += out.len();
            cursor.part_index += 1;
            cursor.is_first_part = false;
            parts.push(out.to_vec());
            if outcome == PartOutcome::Complete {
                return parts;
            }
        }
    }

    #[test]
    fn test_verbosity_from_filter() {
        assert_eq!(Verbosity::from_filter(0x0), Verbosity::Info);
        assert_eq!(Verbosity::from_filter(0x3), Verbosity::Minimal);
        assert_eq!(Verbosity::from_filter(0x7), Verbosity::Normal);
        assert_eq!(Verbosity::from_filter(0xF), Verbosity::Verbose);
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(DictionaryKind::from_name("RWFFld"), Some(DictionaryKind::Field));
        assert_eq!(DictionaryKind::from_name("RWFEnum"), Some(DictionaryKind::Enum));
        assert_eq!(DictionaryKind::from_name("rwffld"), None);
    }

    #[test]
    fn test_info_verbosity_is_summary_only() {
        let payload =
            DictionaryPayload::new(&DataDictionary::builtin(), DictionaryKind::Field, Verbosity::Info)
                .unwrap();
        assert_eq!(payload.entry_count(), 1);
    }

    #[test]
    fn test_dictionary_parts_hold_whole_lines() {
        let dictionary = DataDictionary::builtin();
        let mut payload =
            DictionaryPayload::new(&dictionary, DictionaryKind::Field, Verbosity::Verbose).unwrap();
        let total = payload.total_size();
        let parts = drain(&mut payload, 256);

        assert!(parts.len() > 1);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), total);
        for part in &parts {
            assert!(part.len() <= 256);
            assert_eq!(part.last(), Some(&b'\n'));
        }

        let text: String = parts.iter().map(|p| String::from_utf8_lossy(p).into_owned()).collect();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), dictionary.fields.len() + 1);
        assert_eq!(lines[0]["name"], "RWFFld");
        assert_eq!(lines[1]["ddeAcronym"], "PERMISSION");
    }

    #[test]
    fn test_oversized_entry_is_an_error() {
        let mut payload = DictionaryPayload::new(
            &DataDictionary::builtin(),
            DictionaryKind::Enum,
            Verbosity::Verbose,
        )
        .unwrap();
        let cursor = MultiPartCursor::new(payload.total_size());
        let mut out = BytesMut::new();
        assert!(matches!(
            payload.encode_part(&cursor, &mut out, 8),
            Err(CodecError::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_byte_payload_splits_exactly() {
        let mut payload = BytePayload::new(vec![1u8; 25]);
        let parts = drain(&mut payload, 10);
        assert_eq!(parts.iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 10, 5]);

        let mut empty = BytePayload::new(Vec::new());
        assert_eq!(drain(&mut empty, 10), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"version":"1.0","fields":[{"fid":22,"acronym":"BID","rwfType":"REAL64"}]}"#,
        )
        .unwrap();

        let dictionary = DataDictionary::from_json_file(file.path()).unwrap();
        assert_eq!(dictionary.version, "1.0");
        assert_eq!(dictionary.fields[0].acronym, "BID");
        assert!(dictionary.enum_tables.is_empty());
    }

    #[test]
    fn test_duplicate_fid_rejected() {
        let text = r#"{"fields":[
            {"fid":22,"acronym":"BID","rwfType":"REAL64"},
            {"fid":22,"acronym":"BID2","rwfType":"REAL64"}]}"#;
        assert!(matches!(
            DataDictionary::from_json_str(text),
            Err(DictionaryError::DuplicateFid(22))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            DataDictionary::from_json_file("/nonexistent/dictionary.json"),
            Err(DictionaryError::Io { .. })
        ));
    }
}

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use encoding_rs::{Encoding, EUC_KR, UTF_8};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::LoadError;
use crate::fields::FieldMap;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Copy)]
pub struct EncodingCandidate {
    pub label: &'static str,
    encoding: &'static Encoding,
    strip_bom: bool,
}

// encoding_rs's EUC-KR decoder is the windows-949 superset, so both legacy
// labels share it.
pub const ENCODING_CANDIDATES: [EncodingCandidate; 4] = [
    EncodingCandidate {
        label: "cp949",
        encoding: EUC_KR,
        strip_bom: false,
    },
    EncodingCandidate {
        label: "euc-kr",
        encoding: EUC_KR,
        strip_bom: false,
    },
    EncodingCandidate {
        label: "utf-8",
        encoding: UTF_8,
        strip_bom: false,
    },
    EncodingCandidate {
        label: "utf-8-sig",
        encoding: UTF_8,
        strip_bom: true,
    },
];

impl EncodingCandidate {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        let payload = if self.strip_bom {
            bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
        } else {
            bytes
        };
        self.encoding
            .decode_without_bom_handling_and_without_replacement(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub row_index: usize,
    pub source_file: String,
    pub encoding: String,
    pub values: BTreeMap<String, String>,
}

impl RawRecord {
    /// Trimmed cell value, `None` for blanks and spreadsheet `nan` markers.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|value| clean_value(value))
    }
}

pub fn clean_value(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed)
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub source_file: String,
    pub encoding: &'static str,
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl Table {
    /// A table is usable when some row could yield a query (an address,
    /// standardized or detail column) or carry its own coordinate pair.
    pub fn require_columns(&self, fields: &FieldMap) -> Result<(), LoadError> {
        let has_pair = !fields.latitude.is_empty() && !fields.longitude.is_empty();
        if fields.has_address_source() || has_pair {
            return Ok(());
        }
        let mut missing = vec!["address".to_string()];
        if fields.latitude.is_empty() {
            missing.push("latitude".to_string());
        }
        if fields.longitude.is_empty() {
            missing.push("longitude".to_string());
        }
        Err(LoadError::MissingColumns {
            path: self.source_file.clone(),
            missing,
        })
    }
}

pub fn load_table(path: &Path) -> Result<Table, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let source_file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let delimiter = resolve_delimiter(path);
    let table = parse_table(&bytes, &source_file, delimiter)?;
    info!(
        target: "loader",
        file = %table.source_file,
        encoding = table.encoding,
        rows = table.rows.len(),
        columns = ?table.headers,
        "loaded source table"
    );
    Ok(table)
}

pub fn parse_table(bytes: &[u8], source_file: &str, delimiter: u8) -> Result<Table, LoadError> {
    let (candidate, text) = decode_with_candidates(bytes).ok_or_else(|| LoadError::Unreadable {
        path: source_file.to_string(),
        tried: ENCODING_CANDIDATES
            .iter()
            .map(|candidate| candidate.label)
            .collect::<Vec<_>>()
            .join(", "),
    })?;

    let malformed = |source: csv::Error| LoadError::Malformed {
        path: source_file.to_string(),
        encoding: candidate.label,
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record.map_err(malformed)?;
        let values = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();
        rows.push(RawRecord {
            row_index,
            source_file: source_file.to_string(),
            encoding: candidate.label.to_string(),
            values,
        });
    }

    Ok(Table {
        source_file: source_file.to_string(),
        encoding: candidate.label,
        headers,
        rows,
    })
}

fn decode_with_candidates(bytes: &[u8]) -> Option<(EncodingCandidate, Cow<'_, str>)> {
    if bytes.starts_with(UTF8_BOM) {
        let candidate = ENCODING_CANDIDATES[3];
        return candidate.decode(bytes).map(|text| (candidate, text));
    }
    for candidate in ENCODING_CANDIDATES {
        match candidate.decode(bytes) {
            Some(text) => {
                if candidate.encoding == EUC_KR && is_plausible_utf8(bytes) {
                    warn!(
                        target: "loader",
                        encoding = candidate.label,
                        "input is also valid UTF-8; headers may be misdecoded"
                    );
                }
                return Some((candidate, text));
            }
            None => debug!(target: "loader", encoding = candidate.label, "decode failed"),
        }
    }
    None
}

/// Non-ASCII bytes that also form valid UTF-8.
fn is_plausible_utf8(bytes: &[u8]) -> bool {
    !bytes.is_ascii() && std::str::from_utf8(bytes).is_ok()
}

fn resolve_delimiter(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn decodes_legacy_korean_encoding() {
        let text = "주소,상세\n서울특별시 중구 을지로 30,본관 옆\n";
        let (encoded, _, had_errors) = EUC_KR.encode(text);
        assert!(!had_errors);

        let table = parse_table(&encoded, "seoul.csv", b',').unwrap();
        assert_eq!(table.encoding, "cp949");
        assert_eq!(table.headers, vec!["주소", "상세"]);
        assert_eq!(table.rows[0].get("주소"), Some("서울특별시 중구 을지로 30"));
    }

    #[test]
    fn bom_prefixed_files_use_the_sig_candidate() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("address,detail\nCity Hall,\n".as_bytes());

        let table = parse_table(&bytes, "bom.csv", b',').unwrap();
        assert_eq!(table.encoding, "utf-8-sig");
        assert_eq!(table.headers[0], "address");
        assert_eq!(table.rows[0].get("detail"), None);
    }

    #[test]
    fn undecodable_input_is_unreadable() {
        let bytes = [0x41, 0x2c, 0x42, 0x0a, 0xff, 0xff, 0xff, 0x0a];
        let err = parse_table(&bytes, "broken.csv", b',').unwrap_err();
        assert!(matches!(err, LoadError::Unreadable { .. }));
    }

    #[test]
    fn structural_errors_abort_without_trying_other_encodings() {
        let bytes = b"a,b\n1,2,3\n";
        let err = parse_table(bytes, "ragged.csv", b',').unwrap_err();
        match err {
            LoadError::Malformed { encoding, .. } => assert_eq!(encoding, "cp949"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loads_tab_separated_files_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("부산광역시_흡연구역.tsv");
        let (encoded, _, _) = EUC_KR.encode("주소\t위도\t경도\n부산 중구 중앙대로 1\t35.1\t129.03\n");
        fs::write(&path, &encoded).unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.source_file, "부산광역시_흡연구역.tsv");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].get("위도"), Some("35.1"));
    }

    #[test]
    fn tables_without_address_or_coordinates_are_rejected() {
        let table = parse_table(b"name,lat\nkiosk,37.5\n", "kiosks.csv", b',').unwrap();
        let fields = crate::fields::resolve_fields(&table.headers);
        match table.require_columns(&fields) {
            Err(LoadError::MissingColumns { path, missing }) => {
                assert_eq!(path, "kiosks.csv");
                assert_eq!(missing, vec!["address", "longitude"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let table = parse_table(b"name,lat,lon\nkiosk,37.5,127.0\n", "kiosks.csv", b',').unwrap();
        let fields = crate::fields::resolve_fields(&table.headers);
        assert!(table.require_columns(&fields).is_ok());

        let table = parse_table(b"name,detail\nkiosk,\n", "kiosks.csv", b',').unwrap();
        let fields = crate::fields::resolve_fields(&table.headers);
        assert!(table.require_columns(&fields).is_ok());
    }

    #[test]
    fn flags_utf8_input_accepted_by_the_legacy_decoder() {
        let utf8 = "주소\n강남\n".as_bytes();
        let table = parse_table(utf8, "gangnam.csv", b',').unwrap();
        assert_eq!(table.encoding, "cp949");
        assert_ne!(table.headers[0], "주소");
        assert!(is_plausible_utf8(utf8));

        let (legacy, _, _) = EUC_KR.encode("주소\n강남\n");
        assert!(!is_plausible_utf8(&legacy));
        assert!(!is_plausible_utf8(b"address\nCity Hall\n"));
    }

    #[test]
    fn blank_and_nan_cells_are_absent() {
        assert_eq!(clean_value("  "), None);
        assert_eq!(clean_value("NaN"), None);
        assert_eq!(clean_value(" 37.5 "), Some("37.5"));
    }
}

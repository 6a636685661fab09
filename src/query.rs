use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fields::FieldMap;
use crate::loader::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    ExpandProvince,
    StripSuffix,
    RoadName,
    RegionPrefix,
}

impl RepairStrategy {
    pub const CHAIN: [RepairStrategy; 4] = [
        RepairStrategy::ExpandProvince,
        RepairStrategy::StripSuffix,
        RepairStrategy::RoadName,
        RepairStrategy::RegionPrefix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::ExpandProvince => "expand_province",
            RepairStrategy::StripSuffix => "strip_suffix",
            RepairStrategy::RoadName => "road_name",
            RepairStrategy::RegionPrefix => "region_prefix",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    Direct,
    Repaired(RepairStrategy),
}

impl ResolutionMethod {
    pub fn tag(&self) -> String {
        match self {
            ResolutionMethod::Direct => "direct".to_string(),
            ResolutionMethod::Repaired(strategy) => format!("repaired:{}", strategy.as_str()),
        }
    }
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub query: String,
    pub source_field: String,
    pub method: ResolutionMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ResolutionFailure {
    #[error("no usable address or detail field")]
    NoAddressField,
}

pub fn build_query(record: &RawRecord, fields: &FieldMap) -> Result<ResolvedAddress, ResolutionFailure> {
    let direct = |column: &String, value: &str| ResolvedAddress {
        query: normalize_whitespace(value),
        source_field: column.clone(),
        method: ResolutionMethod::Direct,
    };

    if let Some(column) = &fields.standardized {
        if let Some(value) = record.get(column) {
            return Ok(direct(column, value));
        }
    }

    if let Some(column) = &fields.primary_address {
        if let Some(value) = record.get(column) {
            return Ok(direct(column, value));
        }
    }

    let longest = fields
        .address
        .iter()
        .filter(|column| Some(*column) != fields.primary_address.as_ref())
        .filter_map(|column| record.get(column).map(|value| (column, value)))
        .fold(None, |best: Option<(&String, &str)>, candidate| match best {
            Some(current) if current.1.chars().count() >= candidate.1.chars().count() => {
                Some(current)
            }
            _ => Some(candidate),
        });
    if let Some((column, value)) = longest {
        return Ok(direct(column, value));
    }

    if let Some(column) = &fields.detail {
        if let Some(value) = record.get(column) {
            return Ok(direct(column, value));
        }
    }

    Err(ResolutionFailure::NoAddressField)
}

const PROVINCE_ABBREVIATIONS: &[(&str, &str)] = &[
    ("경북", "경상북도"),
    ("경남", "경상남도"),
    ("충북", "충청북도"),
    ("충남", "충청남도"),
    ("전북", "전라북도"),
    ("전남", "전라남도"),
    ("서울", "서울특별시"),
    ("부산", "부산광역시"),
    ("대구", "대구광역시"),
    ("인천", "인천광역시"),
    ("광주", "광주광역시"),
    ("대전", "대전광역시"),
    ("울산", "울산광역시"),
    ("세종", "세종특별자치시"),
    ("경기", "경기도"),
    ("강원", "강원특별자치도"),
    ("제주", "제주특별자치도"),
];

const DESCRIPTIVE_SUFFIXES: &[&str] = &[
    "본관 옆",
    "본관 앞",
    "청사 옆",
    "청사 앞",
    "건물 옆",
    "건물 앞",
    "next to the main building",
    "next to main building",
    "in front of the main building",
    "in front of main building",
    "next to the annex",
    "in front of the annex",
];

static REGION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(서울특별시|부산광역시|대구광역시|인천광역시|광주광역시|대전광역시|울산광역시|세종특별자치시)",
        r"(경기도|강원특별자치도|충청북도|충청남도|전라북도|전라남도|경상북도|경상남도|제주특별자치도)",
        r"([가-힣]+시|[가-힣]+군|[가-힣]+구)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn token_count(value: &str) -> usize {
    value.split_whitespace().count()
}

pub fn expand_province(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            PROVINCE_ABBREVIATIONS
                .iter()
                .find(|(short, _)| *short == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn strip_suffix(query: &str) -> String {
    let mut stripped = query.to_string();
    for keyword in DESCRIPTIVE_SUFFIXES {
        stripped = replace_case_insensitive(&stripped, keyword);
    }
    normalize_whitespace(&stripped)
        .trim_matches(|c: char| c == ',' || c == '.' || c == '-' || c.is_whitespace())
        .to_string()
}

fn replace_case_insensitive(haystack: &str, needle: &str) -> String {
    let lowered = haystack.to_lowercase();
    // Offsets from the lowered copy are only valid when lowercasing kept the byte length.
    if lowered.len() != haystack.len() {
        return haystack.replace(needle, " ");
    }
    let mut result = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(needle) {
        let start = cursor + found;
        result.push_str(&haystack[cursor..start]);
        result.push(' ');
        cursor = start + needle.len();
    }
    result.push_str(&haystack[cursor..]);
    result
}

pub fn road_name_substitute(query: &str, record: &RawRecord, fields: &FieldMap) -> Option<String> {
    fields
        .road_name
        .iter()
        .filter_map(|column| record.get(column))
        .map(normalize_whitespace)
        .find(|value| value != query)
}

pub fn region_from_file_name(file_name: &str) -> Option<String> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    REGION_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(&stem))
        .and_then(|captures| captures.get(1))
        .map(|region| region.as_str().to_string())
}

pub fn region_prefix(query: &str, source_file: &str) -> Option<String> {
    if token_count(query) >= 3 {
        return None;
    }
    let region = region_from_file_name(source_file)?;
    if query.starts_with(&region) {
        return None;
    }
    Some(format!("{region} {query}"))
}

pub fn apply_strategy(
    strategy: RepairStrategy,
    query: &str,
    record: &RawRecord,
    fields: &FieldMap,
) -> Option<String> {
    let rewritten = match strategy {
        RepairStrategy::ExpandProvince => Some(expand_province(query)),
        RepairStrategy::StripSuffix => Some(strip_suffix(query)),
        RepairStrategy::RoadName => road_name_substitute(query, record, fields),
        RepairStrategy::RegionPrefix => region_prefix(query, &record.source_file),
    }?;
    if rewritten.is_empty() || rewritten == query {
        None
    } else {
        Some(rewritten)
    }
}

/// Candidate rewrites of `query`, following `order` and skipping strategies
/// that leave the query unchanged or repeat an earlier candidate.
pub fn repair_candidates(
    query: &str,
    record: &RawRecord,
    fields: &FieldMap,
    order: &[RepairStrategy],
) -> Vec<ResolvedAddress> {
    let mut candidates: Vec<ResolvedAddress> = Vec::new();
    for strategy in order {
        let Some(rewritten) = apply_strategy(*strategy, query, record, fields) else {
            continue;
        };
        if candidates.iter().any(|existing| existing.query == rewritten) {
            continue;
        }
        let source_field = match strategy {
            RepairStrategy::RoadName => fields
                .road_name
                .iter()
                .find(|column| record.get(column).is_some())
                .cloned()
                .unwrap_or_default(),
            _ => String::new(),
        };
        candidates.push(ResolvedAddress {
            query: rewritten,
            source_field,
            method: ResolutionMethod::Repaired(*strategy),
        });
    }
    candidates
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fields::resolve_fields;

    fn record(file: &str, cells: &[(&str, &str)]) -> (RawRecord, FieldMap) {
        let headers: Vec<String> = cells.iter().map(|(k, _)| k.to_string()).collect();
        let values: BTreeMap<String, String> = cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (
            RawRecord {
                row_index: 0,
                source_file: file.to_string(),
                encoding: "utf-8".into(),
                values,
            },
            resolve_fields(&headers),
        )
    }

    #[test]
    fn prefers_standardized_then_primary_address() {
        let (row, fields) = record(
            "a.csv",
            &[("주소", "중구 을지로 30"), ("표준화주소", "서울특별시 중구 을지로 30")],
        );
        let resolved = build_query(&row, &fields).unwrap();
        assert_eq!(resolved.query, "서울특별시 중구 을지로 30");
        assert_eq!(resolved.source_field, "표준화주소");

        let (row, fields) = record("a.csv", &[("주소", "중구  을지로 30"), ("표준화주소", " ")]);
        let resolved = build_query(&row, &fields).unwrap();
        assert_eq!(resolved.query, "중구 을지로 30");
        assert_eq!(resolved.method, ResolutionMethod::Direct);
    }

    #[test]
    fn falls_back_to_longest_secondary_field_then_detail() {
        let (row, fields) = record(
            "a.csv",
            &[
                ("설치위치", "시청 앞"),
                ("소재지지번주소", "서울특별시 중구 태평로1가 31"),
                ("상세", "광장"),
            ],
        );
        assert_eq!(
            build_query(&row, &fields).unwrap().source_field,
            "소재지지번주소"
        );

        let (row, fields) = record("a.csv", &[("설치위치", ""), ("상세", "시청 광장")]);
        let resolved = build_query(&row, &fields).unwrap();
        assert_eq!(resolved.query, "시청 광장");
        assert_eq!(resolved.source_field, "상세");
    }

    #[test]
    fn no_address_or_detail_is_a_resolution_failure() {
        let (row, fields) = record("a.csv", &[("name", "Somewhere"), ("상세", "")]);
        assert_eq!(
            build_query(&row, &fields),
            Err(ResolutionFailure::NoAddressField)
        );
    }

    #[test]
    fn expands_abbreviated_provinces_per_token() {
        assert_eq!(expand_province("경북 포항시 북구"), "경상북도 포항시 북구");
        assert_eq!(expand_province("서울특별시 중구"), "서울특별시 중구");
    }

    #[test]
    fn strips_descriptive_suffixes() {
        assert_eq!(
            strip_suffix("City Hall annex, in front of the main building"),
            "City Hall annex"
        );
        assert_eq!(strip_suffix("성동구청 본관 옆"), "성동구청");
    }

    #[test]
    fn extracts_region_from_file_name_in_pattern_order() {
        assert_eq!(
            region_from_file_name("서울특별시_중구_흡연시설_20240101.csv").as_deref(),
            Some("서울특별시")
        );
        assert_eq!(
            region_from_file_name("경기도 수원시 흡연구역.csv").as_deref(),
            Some("경기도")
        );
        assert_eq!(
            region_from_file_name("수원시_smoking.csv").as_deref(),
            Some("수원시")
        );
        assert_eq!(region_from_file_name("smoking.csv"), None);
    }

    #[test]
    fn builds_repair_candidates_in_requested_order() {
        let (row, fields) = record(
            "대구광역시_흡연구역.csv",
            &[("설치위치", "경북 본관 옆"), ("도로명주소", "대구광역시 중구 공평로 88")],
        );
        let candidates = repair_candidates("경북 본관 옆", &row, &fields, &RepairStrategy::CHAIN);
        let methods: Vec<String> = candidates.iter().map(|c| c.method.tag()).collect();
        assert_eq!(
            methods,
            vec![
                "repaired:expand_province",
                "repaired:strip_suffix",
                "repaired:road_name",
            ]
        );
        assert_eq!(candidates[0].query, "경상북도 본관 옆");
        assert_eq!(candidates[1].query, "경북");
        assert_eq!(candidates[2].query, "대구광역시 중구 공평로 88");
        assert_eq!(candidates[2].source_field, "도로명주소");

        let short = repair_candidates(
            "시청",
            &row,
            &fields,
            &[RepairStrategy::RegionPrefix, RepairStrategy::StripSuffix],
        );
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].query, "대구광역시 시청");
        assert_eq!(short[0].method.tag(), "repaired:region_prefix");
    }
}

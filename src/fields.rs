use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldRole {
    Address,
    Latitude,
    Longitude,
    Detail,
    RoadName,
    Standardized,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Contains,
    Exact,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub role: FieldRole,
    pub mode: MatchMode,
    pub keywords: &'static [&'static str],
}

impl FieldRule {
    /// Position of the first keyword matching `column`, which doubles as the
    /// alias priority for coordinate roles.
    fn match_rank(&self, column: &str) -> Option<usize> {
        let folded = column.trim().to_lowercase();
        self.keywords.iter().position(|keyword| match self.mode {
            MatchMode::Contains => folded.contains(keyword),
            MatchMode::Exact => folded == *keyword,
        })
    }
}

const ADDRESS_KEYWORDS: &[&str] = &[
    "주소",
    "위치",
    "소재지",
    "설치위치",
    "설치 위치",
    "위치정보",
    "설치장소",
    "장소",
    "지번주소",
    "도로명주소",
    "상세주소",
    "소재지주소",
    "소재지도로명주소",
    "소재지지번주소",
    "소재지(도로명)",
    "흡연시설 설치위치",
    "흡연시설 위치",
    "영업소소재지(도로 명)",
    "시설주소(도로명)",
    "설치도로명주소",
    "address",
    "location",
];

pub const PRIMARY_ADDRESS_NAMES: &[&str] = &["주소", "address"];

pub const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        role: FieldRole::Standardized,
        mode: MatchMode::Exact,
        keywords: &["표준화주소", "standardized_address"],
    },
    FieldRule {
        role: FieldRole::Address,
        mode: MatchMode::Contains,
        keywords: ADDRESS_KEYWORDS,
    },
    FieldRule {
        role: FieldRole::RoadName,
        mode: MatchMode::Contains,
        keywords: &["도로명", "road_address"],
    },
    FieldRule {
        role: FieldRole::Latitude,
        mode: MatchMode::Exact,
        keywords: &["kakao_latitude", "latitude", "위도", "y", "lat"],
    },
    FieldRule {
        role: FieldRole::Latitude,
        mode: MatchMode::Contains,
        keywords: &["위도", "latitude"],
    },
    FieldRule {
        role: FieldRole::Longitude,
        mode: MatchMode::Exact,
        keywords: &[
            "kakao_longitude",
            "longitude",
            "longitutde",
            "경도",
            "x",
            "lon",
            "lng",
        ],
    },
    FieldRule {
        role: FieldRole::Longitude,
        mode: MatchMode::Contains,
        keywords: &["경도", "longitude"],
    },
    FieldRule {
        role: FieldRole::Detail,
        mode: MatchMode::Exact,
        keywords: &["상세", "detail", "details", "상세위치"],
    },
    FieldRule {
        role: FieldRole::Category,
        mode: MatchMode::Exact,
        keywords: &["카테고리", "category"],
    },
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldMap {
    pub address: Vec<String>,
    pub primary_address: Option<String>,
    pub standardized: Option<String>,
    pub road_name: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub detail: Option<String>,
    pub category: Option<String>,
}

impl FieldMap {
    pub fn has_address_source(&self) -> bool {
        !self.address.is_empty() || self.standardized.is_some() || self.detail.is_some()
    }
}

pub fn resolve_fields(headers: &[String]) -> FieldMap {
    resolve_with_rules(headers, FIELD_RULES)
}

pub fn resolve_with_rules(headers: &[String], rules: &[FieldRule]) -> FieldMap {
    let mut map = FieldMap::default();
    // (rule index, keyword rank, column index, column) per coordinate axis
    let mut latitude: Vec<(usize, usize, usize, &String)> = Vec::new();
    let mut longitude: Vec<(usize, usize, usize, &String)> = Vec::new();

    for (column_index, column) in headers.iter().enumerate() {
        for (rule_index, rule) in rules.iter().enumerate() {
            let Some(rank) = rule.match_rank(column) else {
                continue;
            };
            match rule.role {
                FieldRole::Standardized => {
                    map.standardized.get_or_insert_with(|| column.clone());
                }
                FieldRole::Address => {
                    if Some(column) != map.standardized.as_ref() && !map.address.contains(column) {
                        map.address.push(column.clone());
                    }
                }
                FieldRole::RoadName => {
                    if !map.road_name.contains(column) {
                        map.road_name.push(column.clone());
                    }
                }
                FieldRole::Latitude => latitude.push((rule_index, rank, column_index, column)),
                FieldRole::Longitude => longitude.push((rule_index, rank, column_index, column)),
                FieldRole::Detail => {
                    map.detail.get_or_insert_with(|| column.clone());
                }
                FieldRole::Category => {
                    map.category.get_or_insert_with(|| column.clone());
                }
            }
        }
    }

    map.latitude = rank_coordinate_columns(latitude);
    map.longitude = rank_coordinate_columns(longitude);
    map.primary_address = map
        .address
        .iter()
        .find(|column| {
            let folded = column.trim().to_lowercase();
            PRIMARY_ADDRESS_NAMES.contains(&folded.as_str())
        })
        .cloned();
    map
}

fn rank_coordinate_columns(mut matches: Vec<(usize, usize, usize, &String)>) -> Vec<String> {
    matches.sort_by_key(|(rule, rank, column_index, _)| (*rule, *rank, *column_index));
    let mut ordered: Vec<String> = Vec::with_capacity(matches.len());
    for (_, _, _, column) in matches {
        if !ordered.contains(column) {
            ordered.push(column.clone());
        }
    }
    ordered
}

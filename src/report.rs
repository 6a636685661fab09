use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::AppResult;
use crate::loader::Table;
use crate::pipeline::{percent, FailureRecord, RunOutcome};
use crate::store::StoredRecord;

/// Everything a later repair pass needs to rebuild the failed rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLog {
    pub timestamp: DateTime<Utc>,
    pub source_file: String,
    pub encoding: String,
    pub columns: Vec<String>,
    pub total_rows: usize,
    pub successes: usize,
    pub api_calls: usize,
    pub reused_coordinates: usize,
    pub failures: Vec<FailureRecord>,
}

impl FailureLog {
    pub fn from_outcome(table: &Table, outcome: &RunOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            source_file: table.source_file.clone(),
            encoding: table.encoding.to_string(),
            columns: table.headers.clone(),
            total_rows: outcome.stats.total_rows,
            successes: outcome.successes.len(),
            api_calls: outcome.stats.geocode_calls,
            reused_coordinates: outcome.stats.reused,
            failures: outcome.failures.clone(),
        }
    }

    pub fn default_path(now: DateTime<Utc>) -> PathBuf {
        PathBuf::from(format!(
            "failed_geocoding_{}.json",
            now.format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn write(&self, path: &Path) -> AppResult<()> {
        write_json(path, self)?;
        info!(
            target: "report",
            path = %path.display(),
            failures = self.failures.len(),
            "failure log written"
        );
        Ok(())
    }

    pub fn read(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub total: usize,
    pub validated: usize,
    pub geocoded: usize,
    pub complete: usize,
    pub verification_rate: f64,
    pub coordinate_rate: f64,
    pub complete_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub summary: SummaryCounts,
    pub records: Vec<StoredRecord>,
}

impl RunSummary {
    /// Counts come from the run; `records` mirrors what the store now holds.
    /// When the run validated addresses, `coordinate_rate` is the share of
    /// validated rows that also carry coordinates; otherwise it is relative
    /// to all rows.
    pub fn build(outcome: &RunOutcome, records: Vec<StoredRecord>) -> Self {
        let total = outcome.stats.total_rows;
        let validated = outcome
            .successes
            .iter()
            .filter(|success| success.standardized.is_some())
            .count();
        let geocoded = outcome
            .successes
            .iter()
            .filter(|success| success.coordinate.is_finite())
            .count();
        let complete = outcome
            .successes
            .iter()
            .filter(|success| success.standardized.is_some() && success.coordinate.is_finite())
            .count();

        let coordinate_rate = if outcome.stats.validation_calls > 0 {
            percent(complete, validated)
        } else {
            percent(geocoded, total)
        };

        Self {
            generated_at: Utc::now(),
            summary: SummaryCounts {
                total,
                validated,
                geocoded,
                complete,
                verification_rate: percent(validated, total),
                coordinate_rate,
                complete_rate: percent(complete, total),
            },
            records,
        }
    }

    pub fn write(&self, path: &Path) -> AppResult<()> {
        write_json(path, self)?;
        info!(
            target: "report",
            path = %path.display(),
            records = self.records.len(),
            coordinate_rate = self.summary.coordinate_rate,
            "summary written"
        );
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_vec_pretty(value)?;
    fs::write(path, encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::geocode::{Coordinate, CoordinateSource, GeocodeFailure};
    use crate::pipeline::{FailureReason, RunStats, Success};
    use crate::query::{ResolutionMethod, ResolvedAddress};
    use crate::store::PersistedRecord;
    use crate::validator::StandardizedAddress;

    fn success(validated: bool) -> Success {
        Success {
            row_index: 0,
            source_file: "seoul.csv".into(),
            resolved: ResolvedAddress {
                query: "Euljiro 30".into(),
                source_field: "address".into(),
                method: ResolutionMethod::Direct,
            },
            coordinate: Coordinate {
                latitude: 37.56,
                longitude: 126.9,
                source: CoordinateSource::Geocoded,
                provenance: "Euljiro 30".into(),
            },
            standardized: validated.then(|| StandardizedAddress {
                postcode: Some("04524".into()),
                road_address: "Euljiro 30".into(),
                lot_address: String::new(),
            }),
            record: PersistedRecord {
                category: "공공데이타".into(),
                submitted_category: None,
                address: "Euljiro 30".into(),
                detail: None,
                postal_code: None,
                longitude: 126.9,
                latitude: 37.56,
                status: "active".into(),
                report_count: 0,
                resolution_method: "direct".into(),
            },
        }
    }

    #[test]
    fn failure_log_survives_a_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("failures.json");
        let log = FailureLog {
            timestamp: Utc::now(),
            source_file: "seoul.csv".into(),
            encoding: "cp949".into(),
            columns: vec!["주소".into(), "상세".into()],
            total_rows: 2,
            successes: 1,
            api_calls: 2,
            reused_coordinates: 0,
            failures: vec![FailureRecord {
                row_index: 1,
                source_file: "seoul.csv".into(),
                encoding: "cp949".into(),
                query: Some("어딘가".into()),
                source_field: Some("주소".into()),
                reason: FailureReason::Geocode(GeocodeFailure::NoResults),
                message: "no results".into(),
                values: BTreeMap::from([("주소".to_string(), "어딘가".to_string())]),
            }],
        };

        log.write(&path).unwrap();
        assert_eq!(FailureLog::read(&path).unwrap(), log);
    }

    #[test]
    fn default_failure_log_name_is_timestamped() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            FailureLog::default_path(now),
            PathBuf::from("failed_geocoding_20240309_140507.json")
        );
    }

    #[test]
    fn summary_rates_are_relative_to_total_rows_without_validation() {
        let outcome = RunOutcome {
            successes: vec![success(false), success(false)],
            failures: Vec::new(),
            stats: RunStats {
                total_rows: 3,
                ..RunStats::default()
            },
        };
        let summary = RunSummary::build(&outcome, Vec::new());
        assert_eq!(summary.summary.validated, 0);
        assert_eq!(summary.summary.geocoded, 2);
        assert_eq!(summary.summary.coordinate_rate, 66.67);
        assert_eq!(summary.summary.verification_rate, 0.0);
    }

    #[test]
    fn coordinate_rate_is_relative_to_validated_rows_when_validating() {
        let mut unplaced = success(true);
        unplaced.coordinate.latitude = f64::NAN;
        let outcome = RunOutcome {
            successes: vec![success(true), unplaced, success(false)],
            failures: Vec::new(),
            stats: RunStats {
                total_rows: 4,
                validation_calls: 2,
                ..RunStats::default()
            },
        };
        let summary = RunSummary::build(&outcome, Vec::new());
        assert_eq!(summary.summary.validated, 2);
        assert_eq!(summary.summary.geocoded, 2);
        assert_eq!(summary.summary.complete, 1);
        assert_eq!(summary.summary.verification_rate, 50.0);
        assert_eq!(summary.summary.coordinate_rate, 50.0);
        assert_eq!(summary.summary.complete_rate, 25.0);
    }
}

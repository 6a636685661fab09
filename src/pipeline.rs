use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fields::FieldMap;
use crate::geocode::{reuse_coordinates, Coordinate, CoordinateResolver, GeocodeFailure};
use crate::loader::{RawRecord, Table};
use crate::query::{build_query, ResolutionFailure, ResolutionMethod, ResolvedAddress};
use crate::store::PersistedRecord;
use crate::validator::{StandardizedAddress, ValidationFailure, ValidationService};

pub const CITIZEN_REPORT: &str = "시민제보";
pub const PUBLIC_DATA: &str = "공공데이타";
pub const DEFAULT_STATUS: &str = "active";

pub fn normalize_category(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(CITIZEN_REPORT) => CITIZEN_REPORT.to_string(),
        _ => PUBLIC_DATA.to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_rows: usize,
    pub processed: usize,
    pub resolved: usize,
    pub reused: usize,
    pub geocode_calls: usize,
    pub validation_calls: usize,
    pub failures: usize,
    pub repaired: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn success_rate(&self) -> f64 {
        percent(self.resolved, self.processed)
    }

    pub fn reuse_rate(&self) -> f64 {
        percent(self.reused, self.processed)
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Percentage rounded to two decimals; zero when there is nothing to divide by.
pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Success {
    pub row_index: usize,
    pub source_file: String,
    pub resolved: ResolvedAddress,
    pub coordinate: Coordinate,
    pub standardized: Option<StandardizedAddress>,
    pub record: PersistedRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum FailureReason {
    Resolution(ResolutionFailure),
    Validation(ValidationFailure),
    Geocode(GeocodeFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub row_index: usize,
    pub source_file: String,
    pub encoding: String,
    pub query: Option<String>,
    pub source_field: Option<String>,
    pub reason: FailureReason,
    pub message: String,
    pub values: BTreeMap<String, String>,
}

impl FailureRecord {
    fn new(record: &RawRecord, resolved: Option<&ResolvedAddress>, reason: FailureReason) -> Self {
        let message = match &reason {
            FailureReason::Resolution(failure) => failure.to_string(),
            FailureReason::Validation(failure) => failure.to_string(),
            FailureReason::Geocode(failure) => failure.to_string(),
        };
        Self {
            row_index: record.row_index,
            source_file: record.source_file.clone(),
            encoding: record.encoding.clone(),
            query: resolved.map(|resolved| resolved.query.clone()),
            source_field: resolved.map(|resolved| resolved.source_field.clone()),
            reason,
            message,
            values: record.values.clone(),
        }
    }

    /// Rebuilds the source row so a later pass can rewrite its query.
    pub fn raw_record(&self) -> RawRecord {
        RawRecord {
            row_index: self.row_index,
            source_file: self.source_file.clone(),
            encoding: self.encoding.clone(),
            values: self.values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Success(Box<Success>),
    Failure(Box<FailureRecord>),
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub successes: Vec<Success>,
    pub failures: Vec<FailureRecord>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn records(&self) -> Vec<PersistedRecord> {
        self.successes
            .iter()
            .map(|success| success.record.clone())
            .collect()
    }
}

pub struct Pipeline {
    resolver: CoordinateResolver,
    validator: Option<ValidationService>,
    progress_interval: usize,
}

impl Pipeline {
    pub fn new(
        resolver: CoordinateResolver,
        validator: Option<ValidationService>,
        progress_interval: usize,
    ) -> Self {
        Self {
            resolver,
            validator,
            progress_interval: progress_interval.max(1),
        }
    }

    /// Fails with a credential error when no geocoder key is configured.
    pub fn from_config(config: &AppConfig, validate: bool) -> AppResult<Self> {
        let resolver = CoordinateResolver::from_config(config)?;
        let validator = if validate {
            Some(ValidationService::from_config(config)?)
        } else {
            None
        };
        Ok(Self::new(resolver, validator, config.progress_interval))
    }

    pub fn validates(&self) -> bool {
        self.validator.is_some()
    }

    pub async fn run(&self, table: &Table, fields: &FieldMap) -> RunOutcome {
        let mut outcome = RunOutcome {
            stats: RunStats {
                total_rows: table.rows.len(),
                started_at: Some(Utc::now()),
                ..RunStats::default()
            },
            ..RunOutcome::default()
        };

        info!(
            target: "pipeline",
            file = %table.source_file,
            rows = table.rows.len(),
            address_columns = ?fields.address,
            latitude_columns = ?fields.latitude,
            longitude_columns = ?fields.longitude,
            validate = self.validates(),
            "resolution pass started"
        );
        if !fields.has_address_source() {
            warn!(target: "pipeline", file = %table.source_file, "no address-like column found");
        }

        for record in &table.rows {
            match self.process_record(record, fields, &mut outcome.stats).await {
                ValidationOutcome::Success(success) => outcome.successes.push(*success),
                ValidationOutcome::Failure(failure) => outcome.failures.push(*failure),
            }
            outcome.stats.processed += 1;
            if outcome.stats.processed % self.progress_interval == 0 {
                log_progress(&outcome.stats);
            }
        }

        outcome.stats.finished_at = Some(Utc::now());
        info!(
            target: "pipeline",
            total = outcome.stats.total_rows,
            resolved = outcome.stats.resolved,
            reused = outcome.stats.reused,
            geocode_calls = outcome.stats.geocode_calls,
            validation_calls = outcome.stats.validation_calls,
            failures = outcome.stats.failures,
            success_rate = outcome.stats.success_rate(),
            reuse_rate = outcome.stats.reuse_rate(),
            elapsed_secs = outcome.stats.elapsed_secs(),
            "resolution pass finished"
        );
        outcome
    }

    pub async fn process_record(
        &self,
        record: &RawRecord,
        fields: &FieldMap,
        stats: &mut RunStats,
    ) -> ValidationOutcome {
        let resolved = match build_query(record, fields) {
            Ok(resolved) => resolved,
            Err(failure) => {
                debug!(target: "pipeline", row = record.row_index, %failure, "no query");
                stats.failures += 1;
                return ValidationOutcome::Failure(Box::new(FailureRecord::new(
                    record,
                    None,
                    FailureReason::Resolution(failure),
                )));
            }
        };

        if let Some(coordinate) = reuse_coordinates(record, fields) {
            stats.reused += 1;
            stats.resolved += 1;
            debug!(
                target: "pipeline",
                row = record.row_index,
                provenance = %coordinate.provenance,
                "coordinates reused"
            );
            return ValidationOutcome::Success(Box::new(build_success(
                record, fields, resolved, coordinate, None,
            )));
        }

        self.resolve_query(record, fields, resolved, stats).await
    }

    /// Validates (when enabled) and geocodes one query. Shared by the main pass
    /// and by repair, so a rewritten query goes through exactly the same checks.
    pub async fn resolve_query(
        &self,
        record: &RawRecord,
        fields: &FieldMap,
        resolved: ResolvedAddress,
        stats: &mut RunStats,
    ) -> ValidationOutcome {
        let mut geocode_query = resolved.query.clone();
        let mut standardized = None;

        if let Some(validator) = &self.validator {
            stats.validation_calls += 1;
            match validator.validate(&resolved.query).await {
                Ok(found) => {
                    if !found.road_address.is_empty() {
                        geocode_query = found.road_address.clone();
                    }
                    standardized = Some(found);
                }
                Err(failure) => {
                    stats.failures += 1;
                    return ValidationOutcome::Failure(Box::new(FailureRecord::new(
                        record,
                        Some(&resolved),
                        FailureReason::Validation(failure),
                    )));
                }
            }
        }

        stats.geocode_calls += 1;
        match self.resolver.geocode(&geocode_query).await {
            Ok(coordinate) => {
                stats.resolved += 1;
                ValidationOutcome::Success(Box::new(build_success(
                    record,
                    fields,
                    resolved,
                    coordinate,
                    standardized,
                )))
            }
            Err(failure) => {
                warn!(
                    target: "pipeline",
                    row = record.row_index,
                    query = %resolved.query,
                    %failure,
                    "record excluded"
                );
                stats.failures += 1;
                ValidationOutcome::Failure(Box::new(FailureRecord::new(
                    record,
                    Some(&resolved),
                    FailureReason::Geocode(failure),
                )))
            }
        }
    }
}

fn log_progress(stats: &RunStats) {
    info!(
        target: "pipeline",
        processed = stats.processed,
        total = stats.total_rows,
        resolved = stats.resolved,
        failures = stats.failures,
        geocode_calls = stats.geocode_calls,
        reused = stats.reused,
        success_rate = stats.success_rate(),
        "progress"
    );
}

fn build_success(
    record: &RawRecord,
    fields: &FieldMap,
    resolved: ResolvedAddress,
    coordinate: Coordinate,
    standardized: Option<StandardizedAddress>,
) -> Success {
    let raw_address = fields
        .primary_address
        .as_ref()
        .and_then(|column| record.get(column));
    let address = match (&standardized, resolved.method, raw_address) {
        (Some(found), _, _) if !found.road_address.is_empty() => found.road_address.clone(),
        (_, ResolutionMethod::Direct, Some(raw)) => raw.to_string(),
        _ => resolved.query.clone(),
    };
    let category = normalize_category(
        fields
            .category
            .as_ref()
            .and_then(|column| record.get(column)),
    );
    let detail = fields
        .detail
        .as_ref()
        .and_then(|column| record.get(column))
        .map(str::to_string);

    let persisted = PersistedRecord {
        category,
        submitted_category: None,
        address,
        detail,
        postal_code: standardized.as_ref().and_then(|found| found.postcode.clone()),
        longitude: coordinate.longitude,
        latitude: coordinate.latitude,
        status: DEFAULT_STATUS.to_string(),
        report_count: 0,
        resolution_method: resolved.method.tag(),
    };

    Success {
        row_index: record.row_index,
        source_file: record.source_file.clone(),
        resolved,
        coordinate,
        standardized,
        record: persisted,
    }
}

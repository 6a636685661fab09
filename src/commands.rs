use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::fields::resolve_fields;
use crate::loader::load_table;
use crate::pipeline::{Pipeline, RunStats};
use crate::repair::{repair_failures, FailureCategory};
use crate::report::{FailureLog, RunSummary};
use crate::store::{
    ensure_schema, fetch_records, upsert_records, SchemaState, UpsertSummary, WriteMode,
};

#[derive(Debug, Clone)]
pub struct SeedOptions {
    pub csv: PathBuf,
    pub mode: WriteMode,
    pub repair: bool,
    pub failure_log: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
    pub source_file: String,
    pub encoding: String,
    pub stats: RunStats,
    pub upsert: UpsertSummary,
    pub failure_log: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub repaired: usize,
    pub manual_review: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub upsert: Option<UpsertSummary>,
    pub remaining_log: Option<PathBuf>,
}

/// Load, resolve, optionally repair, then write. Failures are logged to disk
/// before the write so a refused or failed write still leaves them for repair.
pub async fn seed(
    pipeline: &Pipeline,
    connection: &mut Connection,
    options: &SeedOptions,
) -> AppResult<SeedReport> {
    let table = load_table(&options.csv)?;
    let fields = resolve_fields(&table.headers);
    table.require_columns(&fields)?;

    let mut outcome = pipeline.run(&table, &fields).await;
    if options.repair && !outcome.failures.is_empty() {
        let failures = outcome.failures.clone();
        let report = repair_failures(pipeline, &failures, &fields, &mut outcome.stats).await;
        report.merge_into(&mut outcome);
    }

    let failure_log = write_failure_log(
        &FailureLog::from_outcome(&table, &outcome),
        options.failure_log.as_deref(),
    )?;

    let records = outcome.records();
    if options.mode == WriteMode::Replace && records.is_empty() {
        return Err(AppError::EmptyBatch);
    }
    let upsert = upsert_records(connection, &records, options.mode)?;

    let summary = match &options.summary {
        Some(path) => {
            RunSummary::build(&outcome, fetch_records(connection)?).write(path)?;
            Some(path.clone())
        }
        None => None,
    };

    Ok(SeedReport {
        source_file: table.source_file,
        encoding: table.encoding.to_string(),
        stats: outcome.stats,
        upsert,
        failure_log,
        summary,
    })
}

fn write_failure_log(log: &FailureLog, requested: Option<&Path>) -> AppResult<Option<PathBuf>> {
    if log.failures.is_empty() {
        return Ok(None);
    }
    let path = requested
        .map(Path::to_path_buf)
        .unwrap_or_else(|| FailureLog::default_path(log.timestamp));
    log.write(&path)?;
    Ok(Some(path))
}

/// Second pass over a failure log. Repaired rows are always appended so
/// earlier seeds survive; rows still failing are written to a sibling
/// `*_manual_review.json` log.
pub async fn repair_from_log(
    pipeline: &Pipeline,
    connection: &mut Connection,
    log_path: &Path,
) -> AppResult<RepairSummary> {
    let log = FailureLog::read(log_path)?;
    let fields = resolve_fields(&log.columns);
    let mut stats = RunStats {
        total_rows: log.failures.len(),
        started_at: Some(Utc::now()),
        ..RunStats::default()
    };

    let report = repair_failures(pipeline, &log.failures, &fields, &mut stats).await;

    let records: Vec<_> = report
        .repaired
        .iter()
        .map(|repaired| repaired.success.record.clone())
        .collect();
    let upsert = if records.is_empty() {
        warn!(target: "repair", log = %log_path.display(), "nothing repaired; store untouched");
        None
    } else {
        Some(upsert_records(connection, &records, WriteMode::Append)?)
    };

    let remaining_log = if report.manual_review.is_empty() {
        None
    } else {
        let remaining = FailureLog {
            timestamp: Utc::now(),
            total_rows: log.failures.len(),
            successes: report.repaired.len(),
            api_calls: stats.geocode_calls,
            reused_coordinates: 0,
            failures: report
                .manual_review
                .iter()
                .map(|review| review.failure.clone())
                .collect(),
            ..log
        };
        let path = manual_review_path(log_path);
        remaining.write(&path)?;
        Some(path)
    };

    Ok(RepairSummary {
        repaired: report.repaired.len(),
        manual_review: report.manual_review.len(),
        by_category: report.by_category,
        upsert,
        remaining_log,
    })
}

fn manual_review_path(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "failures".to_string());
    log_path.with_file_name(format!("{stem}_manual_review.json"))
}

pub fn migrate(connection: &mut Connection) -> AppResult<SchemaState> {
    let tx = connection.transaction()?;
    let state = ensure_schema(&tx)?;
    tx.commit()?;
    info!(target: "store", columns = state.columns.len(), "schema up to date");
    Ok(state)
}

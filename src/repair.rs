use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fields::FieldMap;
use crate::pipeline::{FailureRecord, Pipeline, RunOutcome, RunStats, Success, ValidationOutcome};
use crate::query::{repair_candidates, token_count, RepairStrategy};

const POSITIONAL_KEYWORDS: &[&str] = &["본관", "옆", "앞", "next to", "in front of", "annex"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    LotNumber,
    Descriptive,
    Abbreviated,
    DuplicateRegion,
    Other,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::LotNumber => "lot_number",
            FailureCategory::Descriptive => "descriptive",
            FailureCategory::Abbreviated => "abbreviated",
            FailureCategory::DuplicateRegion => "duplicate_region",
            FailureCategory::Other => "other",
        }
    }

    fn preferred_strategy(&self) -> Option<RepairStrategy> {
        match self {
            FailureCategory::LotNumber => Some(RepairStrategy::RoadName),
            FailureCategory::Descriptive => Some(RepairStrategy::StripSuffix),
            FailureCategory::Abbreviated => Some(RepairStrategy::RegionPrefix),
            FailureCategory::DuplicateRegion => Some(RepairStrategy::RoadName),
            FailureCategory::Other => None,
        }
    }

    /// The category's own strategy first, then the rest of the chain in order.
    pub fn strategy_order(&self) -> Vec<RepairStrategy> {
        let preferred = self.preferred_strategy();
        preferred
            .into_iter()
            .chain(
                RepairStrategy::CHAIN
                    .into_iter()
                    .filter(|strategy| Some(*strategy) != preferred),
            )
            .collect()
    }
}

/// First matching pattern wins.
pub fn classify(address: &str) -> FailureCategory {
    let folded = address.to_lowercase();
    if address.contains("동 ") && ends_with_lot_number(address) {
        FailureCategory::LotNumber
    } else if POSITIONAL_KEYWORDS
        .iter()
        .any(|keyword| folded.contains(keyword))
    {
        FailureCategory::Descriptive
    } else if token_count(address) < 3 {
        FailureCategory::Abbreviated
    } else if address.matches('도').count() > 1 || address.matches('시').count() > 1 {
        FailureCategory::DuplicateRegion
    } else {
        FailureCategory::Other
    }
}

/// `<digits>-<digits>` at the end of the address, e.g. `87-1`.
fn ends_with_lot_number(address: &str) -> bool {
    let Some((head, tail)) = address.trim_end().rsplit_once('-') else {
        return false;
    };
    !tail.is_empty()
        && tail.chars().all(|c| c.is_ascii_digit())
        && head.chars().last().is_some_and(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairedRecord {
    pub category: FailureCategory,
    pub original: FailureRecord,
    pub success: Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReview {
    pub category: FailureCategory,
    pub failure: FailureRecord,
    pub attempted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub repaired: Vec<RepairedRecord>,
    pub manual_review: Vec<ManualReview>,
    pub by_category: BTreeMap<FailureCategory, usize>,
}

impl RepairReport {
    /// Promotes repaired rows to successes; what is left becomes the failure set.
    pub fn merge_into(&self, outcome: &mut RunOutcome) {
        outcome
            .successes
            .extend(self.repaired.iter().map(|repaired| repaired.success.clone()));
        outcome.failures = self
            .manual_review
            .iter()
            .map(|review| review.failure.clone())
            .collect();
        outcome.stats.repaired += self.repaired.len();
        outcome.stats.failures = outcome.failures.len();
    }
}

pub async fn repair_failures(
    pipeline: &Pipeline,
    failures: &[FailureRecord],
    fields: &FieldMap,
    stats: &mut RunStats,
) -> RepairReport {
    let mut report = RepairReport::default();
    info!(target: "repair", failures = failures.len(), "repair pass started");

    for failure in failures {
        let Some(query) = failure.query.as_deref() else {
            debug!(target: "repair", row = failure.row_index, "no query to repair");
            *report.by_category.entry(FailureCategory::Other).or_default() += 1;
            report.manual_review.push(ManualReview {
                category: FailureCategory::Other,
                failure: failure.clone(),
                attempted: Vec::new(),
            });
            continue;
        };

        let category = classify(query);
        *report.by_category.entry(category).or_default() += 1;

        let record = failure.raw_record();
        let candidates = repair_candidates(query, &record, fields, &category.strategy_order());
        let mut attempted = Vec::with_capacity(candidates.len());
        let mut promoted = None;

        for candidate in candidates {
            attempted.push(candidate.query.clone());
            let method = candidate.method;
            match pipeline.resolve_query(&record, fields, candidate, stats).await {
                ValidationOutcome::Success(success) => {
                    info!(
                        target: "repair",
                        row = failure.row_index,
                        original = query,
                        repaired = %success.resolved.query,
                        method = %method,
                        "record repaired"
                    );
                    promoted = Some(*success);
                    break;
                }
                ValidationOutcome::Failure(retry) => {
                    // resolve_query counts each rejected candidate, but the row
                    // was already counted by the main pass.
                    stats.failures = stats.failures.saturating_sub(1);
                    debug!(
                        target: "repair",
                        row = failure.row_index,
                        candidate = ?retry.query,
                        reason = %retry.message,
                        "candidate rejected"
                    );
                }
            }
        }

        match promoted {
            Some(success) => report.repaired.push(RepairedRecord {
                category,
                original: failure.clone(),
                success,
            }),
            None => {
                warn!(
                    target: "repair",
                    row = failure.row_index,
                    query,
                    category = category.as_str(),
                    attempts = attempted.len(),
                    "needs manual review"
                );
                report.manual_review.push(ManualReview {
                    category,
                    failure: failure.clone(),
                    attempted,
                });
            }
        }
    }

    info!(
        target: "repair",
        repaired = report.repaired.len(),
        manual_review = report.manual_review.len(),
        "repair pass finished"
    );
    report
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocode::RateGate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardizedAddress {
    pub postcode: Option<String>,
    pub road_address: String,
    pub lot_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    NoMatch,
    Match(StandardizedAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationFailure {
    #[error("validator found no match")]
    NoMatch,
    #[error("validator returned HTTP {0}")]
    Status(u16),
    #[error("validator response malformed: {0}")]
    Malformed(String),
    #[error("validator request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait AddressValidator: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<ValidationResult, ValidationFailure>;
}

pub struct PostcodifyClient {
    http: reqwest::Client,
    endpoint: String,
    client_version: String,
    client_ref: String,
}

impl PostcodifyClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.validation_url.clone(),
            client_version: config.validation_client_version.clone(),
            client_ref: config.validation_client_ref.clone(),
        })
    }
}

#[async_trait]
impl AddressValidator for PostcodifyClient {
    async fn lookup(&self, query: &str) -> Result<ValidationResult, ValidationFailure> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("v", self.client_version.as_str()),
                ("ref", self.client_ref.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ValidationFailure::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ValidationFailure::Status(status.as_u16()));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ValidationFailure::Malformed(err.to_string()))?;
        normalize_response(&payload)
    }
}

/// Collapses the two response shapes (object with `count`/`results`, or a bare
/// list) into one result type.
pub fn normalize_response(payload: &Value) -> Result<ValidationResult, ValidationFailure> {
    let first = match payload {
        Value::Object(object) if object.contains_key("count") => {
            let count = object.get("count").and_then(Value::as_u64).unwrap_or(0);
            if count == 0 {
                return Ok(ValidationResult::NoMatch);
            }
            object
                .get("results")
                .and_then(Value::as_array)
                .and_then(|results| results.first())
        }
        Value::Array(results) => results.first(),
        _ => {
            return Err(ValidationFailure::Malformed(
                "expected an object with count or a list".into(),
            ))
        }
    };

    let Some(result) = first else {
        return Ok(ValidationResult::NoMatch);
    };

    let text = |key: &str| {
        result
            .get(key)
            .map(|value| match value {
                Value::String(text) => text.trim().to_string(),
                Value::Number(number) => number.to_string(),
                _ => String::new(),
            })
            .unwrap_or_default()
    };
    let join = |left: String, right: String| format!("{left} {right}").trim().to_string();

    let common = text("ko_common");
    Ok(ValidationResult::Match(StandardizedAddress {
        postcode: normalize_postcode(&text("postcode5")),
        road_address: join(common.clone(), text("ko_doro")),
        lot_address: join(common, text("ko_jibeon")),
    }))
}

/// Five-digit postal code; four-digit values lost their leading zero upstream.
pub fn normalize_postcode(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("0{trimmed}"));
    }
    Some(trimmed.to_string())
}

pub struct ValidationService {
    validator: Arc<dyn AddressValidator>,
    gate: RateGate,
}

impl ValidationService {
    pub fn new(validator: Arc<dyn AddressValidator>, min_interval: Duration) -> Self {
        Self {
            validator,
            gate: RateGate::new(min_interval),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let client = PostcodifyClient::new(config)?;
        Ok(Self::new(Arc::new(client), config.validation_min_interval))
    }

    pub async fn validate(&self, query: &str) -> Result<StandardizedAddress, ValidationFailure> {
        match self.gate.run(self.validator.lookup(query)).await {
            Ok(ValidationResult::Match(standardized)) => {
                debug!(
                    target: "validator",
                    query,
                    postcode = ?standardized.postcode,
                    road_address = %standardized.road_address,
                    "validated"
                );
                Ok(standardized)
            }
            Ok(ValidationResult::NoMatch) => {
                warn!(target: "validator", query, "no match");
                Err(ValidationFailure::NoMatch)
            }
            Err(failure) => {
                warn!(target: "validator", query, %failure, "validation failed");
                Err(failure)
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fields::FieldMap;
use crate::loader::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSource {
    Reused,
    Geocoded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub source: CoordinateSource,
    pub provenance: String,
}

impl Coordinate {
    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeMatch {
    pub latitude: f64,
    pub longitude: f64,
    pub matched_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GeocodeFailure {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no results")]
    NoResults,
    #[error("invalid coordinate format in response: {0}")]
    MalformedCoordinate(String),
    #[error("request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<GeocodeMatch, GeocodeFailure>;
}

/// Single-threaded minimum-interval gate: a call may start only once
/// `min_interval` has elapsed since the previous call finished.
pub struct RateGate {
    min_interval: Duration,
    last_finished: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_finished: Mutex::new(None),
        }
    }

    pub async fn run<F, T>(&self, call: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let pending = {
            let guard = self.last_finished.lock();
            (*guard).and_then(|prev| self.min_interval.checked_sub(prev.elapsed()))
        };
        if let Some(remaining) = pending {
            if !remaining.is_zero() {
                trace!(target: "geocoder", wait_ms = remaining.as_millis() as u64, "rate gate wait");
                sleep(remaining).await;
            }
        }
        let output = call.await;
        *self.last_finished.lock() = Some(Instant::now());
        output
    }
}

pub struct KakaoGeocoder {
    http: reqwest::Client,
    endpoint: String,
    auth_scheme: String,
    api_key: SecretString,
}

impl KakaoGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.geocoder_key()?.clone();
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.geocoder_url.clone(),
            auth_scheme: config.geocoder_auth_scheme.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for KakaoGeocoder {
    async fn geocode(&self, query: &str) -> Result<GeocodeMatch, GeocodeFailure> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            documents: Vec<Document>,
        }

        #[derive(Deserialize)]
        struct Document {
            x: Option<Value>,
            y: Option<Value>,
            address_name: Option<String>,
            road_address: Option<RoadAddress>,
        }

        #[derive(Deserialize)]
        struct RoadAddress {
            address_name: Option<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .header(
                "Authorization",
                format!("{} {}", self.auth_scheme, self.api_key.expose_secret()),
            )
            .query(&[("query", query), ("analyze_type", "similar")])
            .send()
            .await
            .map_err(|err| GeocodeFailure::Transport(err.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(GeocodeFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| GeocodeFailure::MalformedCoordinate(err.to_string()))?;
        let document = parsed
            .documents
            .into_iter()
            .next()
            .ok_or(GeocodeFailure::NoResults)?;

        let longitude = parse_axis(document.x.as_ref())
            .ok_or_else(|| GeocodeFailure::MalformedCoordinate(format!("x={:?}", document.x)))?;
        let latitude = parse_axis(document.y.as_ref())
            .ok_or_else(|| GeocodeFailure::MalformedCoordinate(format!("y={:?}", document.y)))?;

        let matched_address = document
            .address_name
            .filter(|name| !name.trim().is_empty())
            .or_else(|| document.road_address.and_then(|road| road.address_name));

        Ok(GeocodeMatch {
            latitude,
            longitude,
            matched_address,
        })
    }
}

fn parse_axis(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// First alias column whose trimmed, non-blank value parses as a finite number.
pub fn pick_coordinate(record: &RawRecord, columns: &[String]) -> Option<(f64, String)> {
    columns.iter().find_map(|column| {
        let value = record.get(column)?.parse::<f64>().ok()?;
        value.is_finite().then(|| (value, column.clone()))
    })
}

pub fn reuse_coordinates(record: &RawRecord, fields: &FieldMap) -> Option<Coordinate> {
    let (latitude, lat_column) = pick_coordinate(record, &fields.latitude)?;
    let (longitude, lon_column) = pick_coordinate(record, &fields.longitude)?;
    Some(Coordinate {
        latitude,
        longitude,
        source: CoordinateSource::Reused,
        provenance: format!("reused:{lat_column}/{lon_column}"),
    })
}

pub struct CoordinateResolver {
    geocoder: Arc<dyn Geocoder>,
    gate: RateGate,
}

impl CoordinateResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, min_interval: Duration) -> Self {
        Self {
            geocoder,
            gate: RateGate::new(min_interval),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let geocoder = KakaoGeocoder::new(config)?;
        Ok(Self::new(Arc::new(geocoder), config.geocoder_min_interval))
    }

    /// Exactly one rate-gated provider call, no retry.
    pub async fn geocode(&self, query: &str) -> Result<Coordinate, GeocodeFailure> {
        let outcome = self.gate.run(self.geocoder.geocode(query)).await;
        match outcome {
            Ok(found) => {
                debug!(
                    target: "geocoder",
                    query,
                    latitude = found.latitude,
                    longitude = found.longitude,
                    "geocoded"
                );
                Ok(Coordinate {
                    latitude: found.latitude,
                    longitude: found.longitude,
                    source: CoordinateSource::Geocoded,
                    provenance: found.matched_address.unwrap_or_else(|| query.to_string()),
                })
            }
            Err(failure) => {
                warn!(target: "geocoder", query, %failure, "geocode failed");
                Err(failure)
            }
        }
    }
}

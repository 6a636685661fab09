use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_GEOCODER_URL: &str = "https://dapi.kakao.com/v2/local/search/address.json";
const DEFAULT_VALIDATION_URL: &str = "https://api.poesis.kr/post/search.php";
const DEFAULT_API_DELAY_SECS: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_url: String,
    pub geocoder_auth_scheme: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_min_interval: Duration,
    pub validation_url: String,
    pub validation_client_version: String,
    pub validation_client_ref: String,
    pub validation_min_interval: Duration,
    pub database_path: String,
    pub progress_interval: usize,
    pub http_timeout: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_url: String,
    pub geocoder_min_interval_ms: u128,
    pub validation_url: String,
    pub validation_min_interval_ms: u128,
    pub database_path: String,
    pub progress_interval: usize,
    pub has_geocoder_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_url: env::var("KAKAO_API_URL")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_URL.to_string()),
            geocoder_auth_scheme: env::var("KAKAO_AUTH_SCHEME")
                .unwrap_or_else(|_| "KakaoAK".to_string()),
            geocoder_api_key: env::var("KAKAO_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_min_interval: parse_seconds("API_DELAY", DEFAULT_API_DELAY_SECS),
            validation_url: env::var("VALIDATION_API_URL")
                .unwrap_or_else(|_| DEFAULT_VALIDATION_URL.to_string()),
            validation_client_version: env::var("VALIDATION_CLIENT_VERSION")
                .unwrap_or_else(|_| "3.0.0-smoking-app".to_string()),
            validation_client_ref: env::var("VALIDATION_CLIENT_REF")
                .unwrap_or_else(|_| "localhost".to_string()),
            validation_min_interval: parse_seconds("VALIDATION_DELAY", DEFAULT_API_DELAY_SECS),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "smoking_areas.db".to_string()),
            progress_interval: parse_usize("PROGRESS_INTERVAL", 25).max(1),
            http_timeout: Duration::from_secs(parse_u64("HTTP_TIMEOUT_SECS", 10).max(1)),
        }
    }

    pub fn geocoder_key(&self) -> AppResult<&SecretString> {
        self.geocoder_api_key.as_ref().ok_or_else(|| {
            AppError::Credential("KAKAO_API_KEY must be set before geocoding".into())
        })
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_url: self.geocoder_url.clone(),
            geocoder_min_interval_ms: self.geocoder_min_interval.as_millis(),
            validation_url: self.validation_url.clone(),
            validation_min_interval_ms: self.validation_min_interval.as_millis(),
            database_path: self.database_path.clone(),
            progress_interval: self.progress_interval,
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_seconds(key: &str, default: f64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("missing credential: {0}")]
    Credential(String),
    #[error(transparent)]
    Persistence(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("no resolved records to write; refusing to clear the store")]
    EmptyBatch,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path} could not be decoded with any of: {tried}")]
    Unreadable { path: String, tried: String },
    #[error("{path} is not a well-formed table ({encoding}): {source}")]
    Malformed {
        path: String,
        encoding: &'static str,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is missing required columns: {missing:?}")]
    MissingColumns { path: String, missing: Vec<String> },
}

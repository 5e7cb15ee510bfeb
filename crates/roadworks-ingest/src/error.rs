//! Error types for the ingestion pipeline
//!
//! Only run-aborting failures are represented here. Per-record problems travel
//! through the record stream as [`crate::source::SourceEvent`] values and are
//! collected into the run report instead.

use crate::schema::SchemaReport;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for roadworks ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Corrupt zip stream: {0}")]
    Archive(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("GeoPackage error: {0}")]
    GeoPackage(#[from] rusqlite::Error),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No {extension} file found inside archive {url}")]
    MissingArchiveMember { url: String, extension: String },

    #[error("Schema drift detected: {0}")]
    SchemaDrift(SchemaReport),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Batch commit failed after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret error: {0}")]
    Secret(#[from] roadworks_common::CommonError),

    #[error("Archive reader task failed: {0}")]
    ReaderTask(String),
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::ReaderTask(err.to_string())
    }
}

impl From<geozero::error::GeozeroError> for IngestError {
    fn from(err: geozero::error::GeozeroError) -> Self {
        IngestError::Geometry(err.to_string())
    }
}

use crate::models::EntityKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Response parse error: {0}")]
    ResponseParse(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Malformed row at line {line}: column '{column}' has value '{value}'")]
    MalformedRow {
        line: usize,
        column: String,
        value: String,
    },

    #[error("Rejected CSV file: {0}")]
    MalformedFile(String),

    #[error("Failed to find or create {kind} '{name}': {reason}")]
    EntityCreationFailed {
        kind: EntityKind,
        name: String,
        reason: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Short description used when recording a failure in a report.
    pub fn reason(&self) -> String {
        match self {
            AppError::HttpStatus { status, body, .. } => format!("HTTP {}: {}", status, body),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TreasuryError {
    #[error("Validation failed on '{field}': {details}")]
    ValidationError { field: String, details: String },

    #[error("Invalid parameter '{key}' = {value}: {details}")]
    InvalidParameter {
        key: String,
        value: f64,
        details: String,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("Concurrent modification of forecast {forecast_id}: expected version {expected}, stored version is {actual}")]
    ConcurrentModification {
        forecast_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Baseline scenario {scenario_id} is still referenced by {dependents} scenario(s)")]
    BaselineReferenced { scenario_id: Uuid, dependents: usize },

    #[error("Cross-total violation for {scope} ({field}): consolidated {actual} != sum of domains {expected}")]
    ConsistencyError {
        scope: String,
        field: String,
        expected: f64,
        actual: f64,
    },

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TreasuryError {
    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(field: &str, details: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreasuryError>;

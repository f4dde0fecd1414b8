// Lockbox — Store error types

use thiserror::Error;

use crate::kms::KmsError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed for field '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("name '{name}' is already in use within {scope}")]
    DuplicateName { name: String, scope: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("version conflict on {id}: expected version {expected_version}")]
    Conflict { id: String, expected_version: u32 },

    #[error("encryption error: {0}")]
    Kms(#[from] KmsError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    pub(crate) fn missing(field: &'static str) -> Self {
        StoreError::Validation {
            field,
            reason: "must be present and non-empty".to_string(),
        }
    }
}

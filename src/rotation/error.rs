// Lockbox — Rotation error types

use thiserror::Error;
use uuid::Uuid;

use crate::kms::KmsError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("rotation run not found: {0}")]
    RunNotFound(Uuid),

    #[error("credential store not found: {0}")]
    StoreNotFound(Uuid),

    #[error("encryption error during rotation: {0}")]
    Kms(#[from] KmsError),

    #[error("store error during rotation: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

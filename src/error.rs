// Lockbox — Top-level error types
//
// Aggregates errors from the kms, store, and rotation modules into a
// single error enum for the application boundary.

use thiserror::Error;

/// Top-level error type for all Lockbox operations.
#[derive(Debug, Error)]
pub enum LockboxError {
    #[error("KMS error: {0}")]
    Kms(#[from] crate::kms::KmsError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] crate::rotation::RotationError),
}

pub type Result<T> = std::result::Result<T, LockboxError>;

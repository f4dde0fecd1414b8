// Lockbox — KMS error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("no wrapper registered for purpose '{0}'")]
    UnknownPurpose(String),

    #[error("key id '{0}' does not resolve to a known key version")]
    UnknownKeyId(String),

    #[error("authentication tag verification failed under key id '{0}'")]
    Integrity(String),

    #[error("encryption provider error: {0}")]
    Provider(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("key derivation error: {0}")]
    Derivation(String),
}

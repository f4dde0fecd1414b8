// Lockbox — Root Key Provider
//
// Manages the lifecycle of the master secret that anchors the wrapper
// key hierarchy. The master secret is stored in the platform's native
// keyring and never exposed in logs, debug output, or process memory
// longer than necessary.
//
// Flow:
//   1. `get_or_create_master_secret()` — retrieves from keyring, or generates + stores a new one
//   2. `derive_root_key()` — uses Argon2id to derive the 32-byte root wrapper key
//   3. The derived key seeds `AeadWrapper::from_root_key` and is zeroized on drop

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::KmsError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Service name used to identify Lockbox entries in the platform keyring.
const KEYRING_SERVICE: &str = "lockbox-credential-engine";

/// Username for the keyring entry (identifies the master secret).
const KEYRING_USER: &str = "master-secret";

/// Length of the randomly generated master secret in bytes (256-bit entropy).
const MASTER_SECRET_LEN: usize = 32;

/// Length of the derived root wrapper key in bytes (256-bit for AES-256).
pub const ROOT_KEY_LEN: usize = 32;

// Argon2id parameters: m=65536 (64 MiB), t=3, p=4
const ARGON2_M_COST: u32 = 65536;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over master key management, enabling platform-specific backends
/// and mock implementations for testing.
pub trait RootKeyProvider {
    /// Retrieve the master secret from the platform keyring.
    /// On first run, generates a new random master secret and stores it.
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, KmsError>;

    /// Derive the root wrapper key from the master secret using Argon2id.
    fn derive_root_key(&self, master_secret: &[u8]) -> Result<Zeroizing<[u8; ROOT_KEY_LEN]>, KmsError>;

    /// Check if a master secret already exists in the keyring.
    fn has_master_secret(&self) -> Result<bool, KmsError>;

    /// Delete the master secret from the platform keyring.
    /// WARNING: Ciphertext sealed under keys derived from it becomes irrecoverable.
    fn delete_master_secret(&self) -> Result<(), KmsError>;
}

// ─── Platform Implementation ─────────────────────────────────────────────────

/// Production implementation using the `keyring` crate.
/// Dispatches to:
///   - Linux: D-Bus Secret Service (GNOME Keyring / KDE Wallet)
///   - macOS: Security.framework Keychain
///   - Windows: Windows Credential Manager
pub struct KeyringRootKeyProvider {
    service: String,
    user: String,
}

impl KeyringRootKeyProvider {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            user: KEYRING_USER.to_string(),
        }
    }

    /// Creates a provider with custom service/user names (useful for testing isolation).
    #[allow(dead_code)]
    pub fn with_names(service: &str, user: &str) -> Self {
        Self {
            service: service.to_string(),
            user: user.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, KmsError> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| KmsError::Keyring(format!("failed to create keyring entry: {}", e)))
    }

    /// Generate a cryptographically secure random master secret.
    fn generate_master_secret() -> Zeroizing<Vec<u8>> {
        let mut secret = Zeroizing::new(vec![0u8; MASTER_SECRET_LEN]);
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    /// Build the deterministic salt for Argon2id.
    /// Salt = SHA-256(service_name || "::" || user_name)
    /// The same master secret always derives the same root key, while the
    /// salt stays unique per installation.
    fn build_salt(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.service.as_bytes());
        hasher.update(b"::");
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl Default for KeyringRootKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn argon2id_derive(
    master_secret: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; ROOT_KEY_LEN]>, KmsError> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(ROOT_KEY_LEN))
        .map_err(|e| KmsError::Derivation(format!("invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut derived = Zeroizing::new([0u8; ROOT_KEY_LEN]);
    argon2
        .hash_password_into(master_secret, salt, derived.as_mut())
        .map_err(|e| KmsError::Derivation(format!("Argon2id hash failed: {}", e)))?;
    Ok(derived)
}

impl RootKeyProvider for KeyringRootKeyProvider {
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let entry = self.entry()?;

        match entry.get_secret() {
            Ok(secret) => {
                tracing::debug!("Retrieved existing master secret from keyring");
                Ok(Zeroizing::new(secret))
            }
            Err(keyring::Error::NoEntry) => {
                // First run: generate and store a new master secret
                tracing::info!("No master secret found — generating new one");
                let secret = Self::generate_master_secret();
                entry.set_secret(&secret).map_err(|e| {
                    KmsError::Keyring(format!("failed to store master secret: {}", e))
                })?;
                tracing::info!("Master secret stored in platform keyring");
                Ok(secret)
            }
            Err(e) => Err(KmsError::Keyring(format!(
                "failed to retrieve master secret: {}",
                e
            ))),
        }
    }

    fn derive_root_key(&self, master_secret: &[u8]) -> Result<Zeroizing<[u8; ROOT_KEY_LEN]>, KmsError> {
        argon2id_derive(master_secret, &self.build_salt())
    }

    fn has_master_secret(&self) -> Result<bool, KmsError> {
        let entry = self.entry()?;
        match entry.get_secret() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KmsError::Keyring(format!(
                "failed to check master secret: {}",
                e
            ))),
        }
    }

    fn delete_master_secret(&self) -> Result<(), KmsError> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::warn!("Master secret deleted from keyring — sealed data is now irrecoverable");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("No master secret to delete");
                Ok(())
            }
            Err(e) => Err(KmsError::Keyring(format!(
                "failed to delete master secret: {}",
                e
            ))),
        }
    }
}

// ─── In-Memory Mock for Testing ──────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::mock::MockRootKeyProvider;
    use super::*;

    #[test]
    fn test_master_secret_generation_has_correct_entropy() {
        let provider = MockRootKeyProvider::new();
        let secret = provider.get_or_create_master_secret().unwrap();
        assert_eq!(
            secret.len(),
            MASTER_SECRET_LEN,
            "Master secret must be exactly {} bytes (256-bit entropy)",
            MASTER_SECRET_LEN
        );
    }

    #[test]
    fn test_master_secret_is_stable_once_created() {
        let provider = MockRootKeyProvider::new();
        let first = provider.get_or_create_master_secret().unwrap();
        let second = provider.get_or_create_master_secret().unwrap();
        assert_eq!(
            first.as_slice(),
            second.as_slice(),
            "Subsequent calls must return the same master secret"
        );
    }

    #[test]
    fn test_argon2id_derivation_deterministic() {
        let provider = MockRootKeyProvider::with_secret(vec![42u8; MASTER_SECRET_LEN]);
        let master = provider.get_or_create_master_secret().unwrap();

        let key1 = provider.derive_root_key(&master).unwrap();
        let key2 = provider.derive_root_key(&master).unwrap();

        assert_eq!(
            key1.as_slice(),
            key2.as_slice(),
            "Same master secret must produce the same derived key"
        );
    }

    #[test]
    fn test_argon2id_different_secrets_produce_different_keys() {
        let provider_a = MockRootKeyProvider::with_secret(vec![1u8; MASTER_SECRET_LEN]);
        let provider_b = MockRootKeyProvider::with_secret(vec![2u8; MASTER_SECRET_LEN]);

        let master_a = provider_a.get_or_create_master_secret().unwrap();
        let master_b = provider_b.get_or_create_master_secret().unwrap();

        let key_a = provider_a.derive_root_key(&master_a).unwrap();
        let key_b = provider_b.derive_root_key(&master_b).unwrap();

        assert_ne!(
            key_a.as_slice(),
            key_b.as_slice(),
            "Different master secrets must produce different derived keys"
        );
    }

    #[test]
    fn test_has_master_secret() {
        let provider = MockRootKeyProvider::new();
        assert!(!provider.has_master_secret().unwrap());

        provider.get_or_create_master_secret().unwrap();
        assert!(provider.has_master_secret().unwrap());
    }

    #[test]
    fn test_delete_master_secret() {
        let provider = MockRootKeyProvider::new();
        provider.get_or_create_master_secret().unwrap();
        assert!(provider.has_master_secret().unwrap());

        provider.delete_master_secret().unwrap();
        assert!(!provider.has_master_secret().unwrap());
    }

    #[test]
    fn test_delete_nonexistent_secret_is_ok() {
        let provider = MockRootKeyProvider::new();
        assert!(provider.delete_master_secret().is_ok());
    }
}

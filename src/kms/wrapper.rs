// Lockbox — Envelope Wrapper
//
// A `Wrapper` is the envelope-encryption provider the storage engine
// seals secret fields with. `AeadWrapper` keeps an ordered list of
// AES-256-GCM key versions: `encrypt` always binds to the active version,
// `decrypt` resolves any retained version by key id, and `rotate` installs
// a freshly generated version as the new active key. Old versions are
// retained so previously sealed fields stay readable until the rotation
// coordinator has re-wrapped them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{KmsError, RootKeyProvider, ROOT_KEY_LEN};

/// AES-GCM nonce length in bytes; the nonce is prepended to the ciphertext.
const NONCE_LEN: usize = 12;

/// HKDF info label for deriving the blind-comparison MAC key from a key version.
const MAC_KEY_INFO: &[u8] = b"lockbox blind-comparison mac v1";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Envelope-encryption provider consumed by the storage engine.
///
/// `current_key_id` must return a single consistent snapshot per call:
/// two nearly-simultaneous callers either both see the old or both see
/// the new active key, never a torn value.
pub trait Wrapper: Send + Sync {
    /// Encrypt `plaintext` under the active key, authenticating `aad`.
    /// Returns the ciphertext and the key id it is bound to.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, String), KmsError>;

    /// Decrypt ciphertext previously produced under `key_id` with the same `aad`.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;

    /// The key id `encrypt` would currently bind to.
    fn current_key_id(&self) -> String;

    /// MAC key derived from the named key version's material, for keyed
    /// blind comparison. Changes across rotation in lockstep with the
    /// encryption key.
    fn mac_key(&self, key_id: &str) -> Result<Zeroizing<[u8; 32]>, KmsError>;
}

impl<T> Wrapper for Arc<T>
where
    T: Wrapper + ?Sized,
{
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, String), KmsError> {
        (**self).encrypt(plaintext, aad)
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        (**self).decrypt(ciphertext, key_id, aad)
    }

    fn current_key_id(&self) -> String {
        (**self).current_key_id()
    }

    fn mac_key(&self, key_id: &str) -> Result<Zeroizing<[u8; 32]>, KmsError> {
        (**self).mac_key(key_id)
    }
}

// ─── AES-256-GCM Implementation ─────────────────────────────────────────────

struct KeyVersion {
    key_id: String,
    key: Zeroizing<[u8; ROOT_KEY_LEN]>,
}

struct Versions {
    entries: Vec<KeyVersion>,
    active: usize,
}

impl Versions {
    fn find(&self, key_id: &str) -> Option<&KeyVersion> {
        self.entries.iter().find(|v| v.key_id == key_id)
    }
}

/// In-process envelope provider holding versioned AES-256-GCM keys.
pub struct AeadWrapper {
    purpose: String,
    versions: RwLock<Versions>,
}

impl std::fmt::Debug for AeadWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadWrapper")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl AeadWrapper {
    /// Create a wrapper for `purpose` with a freshly generated active key.
    pub fn new(purpose: &str) -> Self {
        let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
        rand::thread_rng().fill_bytes(key.as_mut());
        Self::with_key(purpose, key)
    }

    /// Create a wrapper whose initial key version is the supplied root key,
    /// e.g. derived from the platform keyring master secret.
    pub fn from_root_key(purpose: &str, root_key: &[u8; ROOT_KEY_LEN]) -> Self {
        Self::with_key(purpose, Zeroizing::new(*root_key))
    }

    /// Bootstrap a wrapper from the platform master secret: fetch (or
    /// create) it and derive the initial key version with Argon2id.
    pub fn from_provider(
        purpose: &str,
        provider: &dyn RootKeyProvider,
    ) -> Result<Self, KmsError> {
        let master = provider.get_or_create_master_secret()?;
        let root_key = provider.derive_root_key(&master)?;
        Ok(Self::from_root_key(purpose, &root_key))
    }

    fn with_key(purpose: &str, key: Zeroizing<[u8; ROOT_KEY_LEN]>) -> Self {
        let key_id = Self::key_id_for(purpose, key.as_ref());
        tracing::debug!(purpose = %purpose, key_id = %key_id, "Wrapper initialized");
        Self {
            purpose: purpose.to_string(),
            versions: RwLock::new(Versions {
                entries: vec![KeyVersion { key_id, key }],
                active: 0,
            }),
        }
    }

    /// Key ids are `<purpose>_<fingerprint>`: stable, unique per key
    /// material, and safe to persist alongside ciphertext.
    fn key_id_for(purpose: &str, key: &[u8]) -> String {
        let digest = Sha256::digest(key);
        format!("{}_{}", purpose, hex::encode(&digest[..6]))
    }

    /// Install a freshly generated key version and make it active.
    /// Returns the new key id. Previously active versions remain
    /// resolvable for decryption until they are retired.
    pub fn rotate(&self) -> String {
        let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
        rand::thread_rng().fill_bytes(key.as_mut());
        let key_id = Self::key_id_for(&self.purpose, key.as_ref());

        let mut versions = self.versions.write().unwrap();
        versions.entries.push(KeyVersion {
            key_id: key_id.clone(),
            key,
        });
        versions.active = versions.entries.len() - 1;
        tracing::info!(purpose = %self.purpose, key_id = %key_id, "Wrapper rotated to new key version");
        key_id
    }

    /// Drop a retained key version, making ciphertext bound to it
    /// undecryptable. The active version cannot be retired.
    pub fn retire(&self, key_id: &str) -> Result<(), KmsError> {
        let mut versions = self.versions.write().unwrap();
        let active_id = versions.entries[versions.active].key_id.clone();
        if active_id == key_id {
            return Err(KmsError::Provider(format!(
                "refusing to retire active key id '{}'",
                key_id
            )));
        }
        let before = versions.entries.len();
        versions.entries.retain(|v| v.key_id != key_id);
        if versions.entries.len() == before {
            return Err(KmsError::UnknownKeyId(key_id.to_string()));
        }
        // The active entry survived the retain; re-locate its index.
        versions.active = versions
            .entries
            .iter()
            .position(|v| v.key_id == active_id)
            .expect("active key version must survive retire");
        Ok(())
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

impl Wrapper for AeadWrapper {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, String), KmsError> {
        // Snapshot the active version under one read acquisition so the
        // key and the returned id can never disagree.
        let (key, key_id) = {
            let versions = self.versions.read().unwrap();
            let active = &versions.entries[versions.active];
            (active.key.clone(), active.key_id.clone())
        };

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| KmsError::Provider(format!("invalid AES key: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| KmsError::Provider(format!("AEAD encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok((out, key_id))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let key = {
            let versions = self.versions.read().unwrap();
            let version = versions
                .find(key_id)
                .ok_or_else(|| KmsError::UnknownKeyId(key_id.to_string()))?;
            version.key.clone()
        };

        if ciphertext.len() < NONCE_LEN {
            return Err(KmsError::Integrity(key_id.to_string()));
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| KmsError::Provider(format!("invalid AES key: {}", e)))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: sealed, aad })
            .map_err(|_| KmsError::Integrity(key_id.to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }

    fn current_key_id(&self) -> String {
        let versions = self.versions.read().unwrap();
        versions.entries[versions.active].key_id.clone()
    }

    fn mac_key(&self, key_id: &str) -> Result<Zeroizing<[u8; 32]>, KmsError> {
        let key = {
            let versions = self.versions.read().unwrap();
            let version = versions
                .find(key_id)
                .ok_or_else(|| KmsError::UnknownKeyId(key_id.to_string()))?;
            version.key.clone()
        };

        let hkdf = Hkdf::<Sha256>::new(Some(self.purpose.as_bytes()), key.as_ref());
        let mut mac_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(MAC_KEY_INFO, mac_key.as_mut())
            .map_err(|_| KmsError::Derivation("failed to derive MAC key material".into()))?;
        Ok(mac_key)
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Resolves a configured encryption purpose to its wrapper. Purposes are
/// wired out-of-band (e.g. "database", "recovery"); the storage engine
/// only ever uses the purpose bound to a given credential store and takes
/// the resolved wrapper as an explicit parameter.
pub struct WrapperRegistry {
    wrappers: HashMap<String, Arc<AeadWrapper>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self {
            wrappers: HashMap::new(),
        }
    }

    pub fn register(&mut self, wrapper: Arc<AeadWrapper>) {
        self.wrappers
            .insert(wrapper.purpose().to_string(), wrapper);
    }

    pub fn resolve(&self, purpose: &str) -> Result<Arc<AeadWrapper>, KmsError> {
        self.wrappers
            .get(purpose)
            .cloned()
            .ok_or_else(|| KmsError::UnknownPurpose(purpose.to_string()))
    }

    pub fn purposes(&self) -> Vec<&str> {
        self.wrappers.keys().map(String::as_str).collect()
    }
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

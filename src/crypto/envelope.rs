// Lockbox — Envelope Codec
//
// `seal` encrypts a secret field through the wrapper and computes a keyed
// HMAC over the plaintext; `open` reverses it. The HMAC exists purely for
// blind equality comparison — primary integrity is the AEAD tag inside
// the wrapper ciphertext. The MAC key is derived from the same key
// version as the ciphertext, so both change in lockstep under rotation.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::kms::{KmsError, Wrapper};

type HmacSha256 = Hmac<Sha256>;

// ─── Additional Authenticated Data ───────────────────────────────────────────

/// Deterministic AAD binding a sealed field to its exact storage slot, so
/// ciphertext from one field cannot be silently substituted for another's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aad(Vec<u8>);

impl Aad {
    pub fn new(store_id: &Uuid, credential_id: &Uuid, field_name: &str) -> Self {
        Self(
            format!(
                "lockbox:v1|store:{}|cred:{}|field:{}",
                store_id, credential_id, field_name
            )
            .into_bytes(),
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ─── Persisted Triple ────────────────────────────────────────────────────────

/// The persisted representation of one secret field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedField {
    pub ciphertext: Vec<u8>,
    pub hmac: Vec<u8>,
    pub key_id: String,
}

/// A secret field is either transient plaintext or its sealed triple.
/// Only the `Sealed` arm is ever handed to the storage layer — row
/// writers take `&SealedField`, so a `Plaintext` value cannot reach a
/// persisted column.
pub enum SecretField {
    Plaintext(Zeroizing<Vec<u8>>),
    Sealed(SealedField),
}

impl SecretField {
    pub fn as_sealed(&self) -> Option<&SealedField> {
        match self {
            SecretField::Sealed(sealed) => Some(sealed),
            SecretField::Plaintext(_) => None,
        }
    }
}

impl fmt::Debug for SecretField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretField::Plaintext(_) => f.write_str("SecretField::Plaintext([REDACTED])"),
            SecretField::Sealed(sealed) => f.debug_tuple("SecretField::Sealed").field(sealed).finish(),
        }
    }
}

// ─── Codec Operations ────────────────────────────────────────────────────────

/// Seal one plaintext field: encrypt through the wrapper and compute the
/// blind-comparison HMAC under the MAC key of the same key version.
///
/// A zero-length plaintext seals like any other value; absence of an
/// optional field is modeled as "no SealedField", never as a sealed
/// empty byte string.
pub fn seal(wrapper: &dyn Wrapper, plaintext: &[u8], aad: &Aad) -> Result<SealedField, KmsError> {
    let (ciphertext, key_id) = wrapper.encrypt(plaintext, aad.as_bytes())?;
    let hmac = compute_hmac(wrapper, &key_id, plaintext)?;
    Ok(SealedField {
        ciphertext,
        hmac,
        key_id,
    })
}

/// Open a sealed field back to plaintext. An authentication failure in
/// the wrapper surfaces as `KmsError::Integrity`, independent of the
/// stored HMAC.
pub fn open(
    wrapper: &dyn Wrapper,
    sealed: &SealedField,
    aad: &Aad,
) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    wrapper.decrypt(&sealed.ciphertext, &sealed.key_id, aad.as_bytes())
}

/// Test whether `candidate` equals the sealed plaintext without
/// decrypting: recompute the HMAC under the key version bound to the
/// sealed field and compare in constant time.
pub fn verify_equals(
    wrapper: &dyn Wrapper,
    sealed: &SealedField,
    candidate: &[u8],
    _aad: &Aad,
) -> Result<bool, KmsError> {
    let mac_key = wrapper.mac_key(&sealed.key_id)?;
    let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
        .map_err(|e| KmsError::Derivation(format!("invalid MAC key length: {}", e)))?;
    mac.update(candidate);
    Ok(mac.verify_slice(&sealed.hmac).is_ok())
}

fn compute_hmac(wrapper: &dyn Wrapper, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
    let mac_key = wrapper.mac_key(key_id)?;
    let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
        .map_err(|e| KmsError::Derivation(format!("invalid MAC key length: {}", e)))?;
    mac.update(plaintext);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::AeadWrapper;

    fn test_aad() -> Aad {
        Aad::new(&Uuid::new_v4(), &Uuid::new_v4(), "password")
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();

        let sealed = seal(&wrapper, b"hunter2", &aad).unwrap();
        assert_eq!(sealed.key_id, wrapper.current_key_id());
        assert!(!sealed.ciphertext.is_empty());
        assert_eq!(sealed.hmac.len(), 32);

        let pt = open(&wrapper, &sealed, &aad).unwrap();
        assert_eq!(pt.as_slice(), b"hunter2");
    }

    #[test]
    fn test_empty_plaintext_seals_like_any_other() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();

        let sealed = seal(&wrapper, b"", &aad).unwrap();
        let pt = open(&wrapper, &sealed, &aad).unwrap();
        assert!(pt.is_empty());
        assert!(verify_equals(&wrapper, &sealed, b"", &aad).unwrap());
        assert!(!verify_equals(&wrapper, &sealed, b"x", &aad).unwrap());
    }

    #[test]
    fn test_open_with_wrong_slot_fails() {
        let wrapper = AeadWrapper::new("database");
        let store_id = Uuid::new_v4();
        let cred_id = Uuid::new_v4();

        let aad_password = Aad::new(&store_id, &cred_id, "password");
        let aad_passphrase = Aad::new(&store_id, &cred_id, "private_key_passphrase");

        let sealed = seal(&wrapper, b"hunter2", &aad_password).unwrap();
        let err = open(&wrapper, &sealed, &aad_passphrase).unwrap_err();
        assert!(matches!(err, KmsError::Integrity(_)));
    }

    #[test]
    fn test_verify_equals_matches_only_same_plaintext() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();

        let sealed = seal(&wrapper, b"hunter2", &aad).unwrap();
        assert!(verify_equals(&wrapper, &sealed, b"hunter2", &aad).unwrap());
        assert!(!verify_equals(&wrapper, &sealed, b"hunter3", &aad).unwrap());
    }

    #[test]
    fn test_hmac_deterministic_for_fixed_key_version() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();

        let a = seal(&wrapper, b"same secret", &aad).unwrap();
        let b = seal(&wrapper, b"same secret", &aad).unwrap();

        // Fresh nonce per seal, so ciphertext differs; HMAC is the stable
        // handle for blind duplicate detection.
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(a.hmac, b.hmac);
    }

    #[test]
    fn test_hmac_changes_in_lockstep_with_rotation() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();

        let before = seal(&wrapper, b"secret", &aad).unwrap();
        wrapper.rotate();
        let after = seal(&wrapper, b"secret", &aad).unwrap();

        assert_ne!(before.key_id, after.key_id);
        assert_ne!(before.hmac, after.hmac);

        // A pre-rotation field still verifies: the MAC key is bound to
        // the field's own key id, not the active one.
        assert!(verify_equals(&wrapper, &before, b"secret", &aad).unwrap());
    }

    #[test]
    fn test_secret_field_debug_redacts_plaintext() {
        let field = SecretField::Plaintext(Zeroizing::new(b"ghp_super_secret".to_vec()));
        let rendered = format!("{:?}", field);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("ghp_super_secret"));
    }

    #[test]
    fn test_secret_field_as_sealed() {
        let wrapper = AeadWrapper::new("database");
        let aad = test_aad();
        let sealed = seal(&wrapper, b"v", &aad).unwrap();

        assert!(SecretField::Sealed(sealed).as_sealed().is_some());
        assert!(SecretField::Plaintext(Zeroizing::new(vec![]))
            .as_sealed()
            .is_none());
    }
}

// Lockbox — Crypto Module
//
// The envelope codec: turns a plaintext secret field into its persisted
// `{ciphertext, hmac, key_id}` triple and back, and supports keyed blind
// comparison without decryption.

mod envelope;

pub use envelope::{open, seal, verify_equals, Aad, SealedField, SecretField};

// Lockbox — Store Module
//
// Durable storage for credential stores and their credentials. Secret
// fields are persisted only as sealed `{ciphertext, hmac, key_id}`
// triples; plaintext exists solely in request/response structs. Writers
// contend through version-conditional updates, never an engine lock.

mod db;
mod error;
mod models;
mod registry;
mod repository;

pub use db::Database;
pub use error::StoreError;
pub use models::{
    field, Credential, CredentialMeta, CredentialStore, CredentialStoreChanges,
    DecryptedCredential, DecryptedJson, DecryptedSshPrivateKey, DecryptedUsernamePassword,
    JsonChanges, JsonCredential, NewJson, NewSshPrivateKey, NewUsernamePassword,
    SecretColumn, SshPrivateKeyChanges, SshPrivateKeyCredential, UsernamePasswordChanges,
    UsernamePasswordCredential, VariantTable, VARIANT_TABLES,
};
pub use registry::CredentialStoreRegistry;
pub use repository::CredentialRepository;

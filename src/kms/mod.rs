// Lockbox — KMS Module
//
// Envelope-encryption providers. A `Wrapper` turns plaintext into
// ciphertext bound to a named key version; the `WrapperRegistry` resolves
// a configured purpose ("database", "recovery", ...) to its wrapper.
// Root key material comes from the platform keyring via `RootKeyProvider`.

mod error;
mod provider;
mod wrapper;

pub use error::KmsError;
pub use provider::{KeyringRootKeyProvider, RootKeyProvider, ROOT_KEY_LEN};
pub use wrapper::{AeadWrapper, Wrapper, WrapperRegistry};

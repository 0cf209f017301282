//! Sesam core library
//!
//! Deterministic password vault: per-domain generation parameters are kept
//! in an encrypted store, passwords are recomputed from a key generation key
//! (KGK), and the store is merged with sync peers (a file or a server).

pub mod config;
pub mod crypto;
pub mod domain;
pub mod import_export;
pub mod platform;
pub mod settings;
pub mod sync;
pub mod vault;

pub use config::SesamConfig;
pub use crypto::{
    CryptoError, KdfParams, PasswordGenerator, SecureBuffer, TemplateClasses, TemplateGenerator,
};
pub use domain::{DomainSettings, DomainSettingsList};
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};
pub use sync::{SyncConfig, SyncEngine, SyncOutcome, SyncPhase};
pub use vault::Vault;

use thiserror::Error;

/// Result type for vault and sync operations
pub type Result<T> = std::result::Result<T, SesamError>;

/// General error type for vault and sync operations
#[derive(Error, Debug)]
pub enum SesamError {
    /// Wrong master password or a tampered envelope
    #[error("Decryption failed: wrong master password or corrupted data")]
    Credential,

    #[error("Sync peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Decrypted fine but the content is not what we expect
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid KGK: expected {expected} bytes, got {got}")]
    InvalidKgk { expected: usize, got: usize },

    #[error("Master key or IV not derived")]
    InvalidCredentials,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl SesamError {
    /// True when the caller should ask for the master password again.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, SesamError::Credential)
    }
}

impl From<CryptoError> for SesamError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed | CryptoError::InvalidFormat(_) => SesamError::Credential,
            CryptoError::CompressionFailed(msg) => SesamError::MalformedPayload(msg),
            CryptoError::MissingKeyMaterial => SesamError::InvalidCredentials,
            other => SesamError::Crypto(other),
        }
    }
}

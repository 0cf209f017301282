//! Cryptographic primitives.
//!
//! This module provides:
//! - Argon2id key derivation
//! - Envelope encryption of the KGK and payload (AES-256-GCM)
//! - Deterministic password generation
//! - Zeroization utilities

pub mod crypter;
pub mod kdf;
pub mod password;
pub mod zero;

pub use crypter::{decode, decode_async, decode_with_keys, encode, Decoded, COMPRESSION_ENABLED, KGK_SIZE};
pub use kdf::{derive_key, derive_key_async, generate_salt, KdfParams, KeyMaterial};
pub use password::{
    generate_domain_salt, generate_kgk, make_template, PasswordGenerator, TemplateClasses,
    TemplateGenerator,
};
pub use zero::SecureBuffer;

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Authentication failed - wrong password or tampered data")]
    AuthenticationFailed,

    #[error("Invalid envelope: {0}")]
    InvalidFormat(String),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Master key or IV not derived")]
    MissingKeyMaterial,

    #[error("Password generation failed: {0}")]
    PasswordGeneration(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

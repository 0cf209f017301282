//! Argon2id key derivation for the master password.
//!
//! One derivation yields 44 bytes: a 32-byte AES key followed by a 12-byte
//! IV. The IV is never used as a GCM nonce; the envelope binds it into the
//! key-wrap as associated data.
//!
//! Default parameters:
//! - Memory cost: 64 MiB (65,536 KiB)
//! - Time cost: 3 passes
//! - Parallelism: 4 lanes
//! - Salt length: 32 bytes

use crate::crypto::{CryptoError, Result, SecureBuffer};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Length of the derived AES key
pub const KEY_SIZE: usize = 32;

/// Length of the derived IV
pub const IV_SIZE: usize = 12;

/// Length of the random KDF salt
pub const SALT_SIZE: usize = 32;

/// Largest accepted memory cost: 256 MiB, four times the default.
///
/// Envelope headers are read before anything is authenticated, so a peer
/// must not be able to demand an arbitrary allocation.
pub const MAX_MEM_COST: u32 = 4 * 65_536;

/// Largest accepted time cost.
pub const MAX_TIME_COST: u32 = 16;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of passes)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost: 65_536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            mem_cost,
            time_cost,
            parallelism,
        }
    }

    /// Minimal parameters so tests do not spend seconds in Argon2.
    pub fn for_testing() -> Self {
        Self {
            mem_cost: 256,
            time_cost: 1,
            parallelism: 1,
        }
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.parallelism < 1 || self.parallelism > 16 {
            return Err(CryptoError::KdfFailed(format!(
                "Parallelism out of range: {}",
                self.parallelism
            )));
        }
        if self.time_cost < 1 || self.time_cost > MAX_TIME_COST {
            return Err(CryptoError::KdfFailed(format!(
                "Time cost out of range: {}",
                self.time_cost
            )));
        }
        if self.mem_cost < 8 * self.parallelism || self.mem_cost > MAX_MEM_COST {
            return Err(CryptoError::KdfFailed(format!(
                "Memory cost out of range: {} KiB",
                self.mem_cost
            )));
        }
        Ok(())
    }
}

/// Key and IV derived from a master password, plus the salt and
/// parameters that produced them.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    key: SecureBuffer,
    iv: SecureBuffer,
    salt: Vec<u8>,
    params: KdfParams,
}

impl KeyMaterial {
    pub fn key(&self) -> &SecureBuffer {
        &self.key
    }

    pub fn iv(&self) -> &SecureBuffer {
        &self.iv
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// True when both key and IV hold derived material.
    pub fn is_valid(&self) -> bool {
        !self.key.is_empty() && !self.iv.is_empty()
    }

    /// Erase key and IV. The salt is not secret and is kept.
    pub fn invalidate(&mut self) {
        self.key.invalidate();
        self.iv.invalidate();
    }
}

/// Generate a fresh random salt
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive key and IV from a password and salt using Argon2id
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<KeyMaterial> {
    params.validate()?;

    let params_obj = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE + IV_SIZE),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params_obj);

    let mut output = SecureBuffer::new(vec![0u8; KEY_SIZE + IV_SIZE]);
    argon2
        .hash_password_into(password, salt, output.as_mut_bytes())
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let bytes = output.as_bytes();
    Ok(KeyMaterial {
        key: SecureBuffer::from_slice(&bytes[..KEY_SIZE]),
        iv: SecureBuffer::from_slice(&bytes[KEY_SIZE..]),
        salt: salt.to_vec(),
        params: *params,
    })
}

/// Derive key material on the blocking pool.
///
/// Must not run on a runtime worker: default parameters take hundreds of
/// milliseconds.
pub async fn derive_key_async(
    password: SecureBuffer,
    salt: Vec<u8>,
    params: KdfParams,
) -> Result<KeyMaterial> {
    let material = tokio::task::spawn_blocking(move || derive_key(password.as_bytes(), &salt, &params))
        .await
        .map_err(|e| CryptoError::KdfFailed(format!("Key derivation task failed: {}", e)))??;

    debug!(
        "Derived key material (salt {})",
        salt_fingerprint(material.salt())
    );
    Ok(material)
}

/// Derive key material under a freshly generated salt.
pub async fn regenerate(password: SecureBuffer, params: KdfParams) -> Result<KeyMaterial> {
    derive_key_async(password, generate_salt(), params).await
}

/// First four salt bytes in hex, safe to put in logs.
pub fn salt_fingerprint(salt: &[u8]) -> String {
    salt.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

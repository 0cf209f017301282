//! Envelope encryption of the KGK and a payload under the master password.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! format(1) | mem_cost(4) | time_cost(4) | parallelism(4) | salt(32)
//!   | wrap_nonce(12) | wrapped(112) | data_nonce(12) | payload(..)
//! ```
//!
//! `wrapped` is AES-256-GCM under the Argon2 key of `data_key(32) || kgk(64)`
//! with the derived IV as associated data. `payload` is AES-256-GCM under the
//! random `data_key` of the (optionally DEFLATE-compressed) payload bytes.
//! Both nonces are random per encode, so reusing one [`KeyMaterial`] for
//! several encodes never repeats a (key, nonce) pair.

use crate::crypto::kdf::{self, KdfParams, KeyMaterial, SALT_SIZE};
use crate::crypto::{CryptoError, Result, SecureBuffer};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::{Read, Write};
use tracing::error;

/// Current envelope format byte
pub const FORMAT_V1: u8 = 0x01;

/// Size of a key generation key
pub const KGK_SIZE: usize = 64;

/// Compression is a vault-wide constant, not a per-record choice
pub const COMPRESSION_ENABLED: bool = true;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const DATA_KEY_SIZE: usize = 32;
const WRAPPED_SIZE: usize = DATA_KEY_SIZE + KGK_SIZE + TAG_SIZE;
const PARAMS_SIZE: usize = 12;

const SALT_OFFSET: usize = 1 + PARAMS_SIZE;
const WRAP_NONCE_OFFSET: usize = SALT_OFFSET + SALT_SIZE;
const WRAPPED_OFFSET: usize = WRAP_NONCE_OFFSET + NONCE_SIZE;
const DATA_NONCE_OFFSET: usize = WRAPPED_OFFSET + WRAPPED_SIZE;
const HEADER_SIZE: usize = DATA_NONCE_OFFSET + NONCE_SIZE;

/// Result of a successful decode
#[derive(Debug)]
pub struct Decoded {
    /// The original payload bytes
    pub payload: SecureBuffer,

    /// The KGK recovered from the envelope
    pub kgk: SecureBuffer,
}

/// Encrypt `payload` together with `kgk` under previously derived key material.
pub fn encode(
    keys: &KeyMaterial,
    kgk: &SecureBuffer,
    payload: &[u8],
    use_compression: bool,
) -> Result<Vec<u8>> {
    if !keys.is_valid() {
        error!("Refusing to encode: master key or IV not derived");
        return Err(CryptoError::MissingKeyMaterial);
    }
    if kgk.len() != KGK_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KGK_SIZE,
            got: kgk.len(),
        });
    }
    if keys.salt().len() != SALT_SIZE {
        return Err(CryptoError::EncryptionFailed(format!(
            "Salt must be {} bytes",
            SALT_SIZE
        )));
    }

    let body = if use_compression {
        SecureBuffer::new(compress(payload)?)
    } else {
        SecureBuffer::from_slice(payload)
    };

    let data_key = Aes256Gcm::generate_key(&mut OsRng);
    let data_cipher = Aes256Gcm::new(&data_key);
    let data_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let encrypted_body = data_cipher
        .encrypt(&data_nonce, body.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(format!("Payload encryption failed: {}", e)))?;

    let mut secrets = SecureBuffer::new(Vec::with_capacity(DATA_KEY_SIZE + KGK_SIZE));
    secrets.extend_from_slice(data_key.as_slice());
    secrets.extend_from_slice(kgk.as_bytes());

    let wrap_cipher = Aes256Gcm::new_from_slice(keys.key().as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: kdf::KEY_SIZE,
            got: keys.key().len(),
        })?;
    let wrap_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let wrapped = wrap_cipher
        .encrypt(
            &wrap_nonce,
            Payload {
                msg: secrets.as_bytes(),
                aad: keys.iv().as_bytes(),
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(format!("Key wrap failed: {}", e)))?;

    let params = keys.params();
    let mut out = Vec::with_capacity(HEADER_SIZE + encrypted_body.len());
    out.push(FORMAT_V1);
    out.extend_from_slice(&params.mem_cost.to_le_bytes());
    out.extend_from_slice(&params.time_cost.to_le_bytes());
    out.extend_from_slice(&params.parallelism.to_le_bytes());
    out.extend_from_slice(keys.salt());
    out.extend_from_slice(&wrap_nonce);
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&data_nonce);
    out.extend_from_slice(&encrypted_body);

    Ok(out)
}

/// Read the salt and KDF parameters from an envelope header.
pub fn read_header(cipher: &[u8]) -> Result<(Vec<u8>, KdfParams)> {
    if cipher.len() < HEADER_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidFormat(format!(
            "Envelope too short: {} bytes",
            cipher.len()
        )));
    }
    if cipher[0] != FORMAT_V1 {
        return Err(CryptoError::InvalidFormat(format!(
            "Unknown envelope format 0x{:02x}",
            cipher[0]
        )));
    }

    let params = KdfParams::new(
        read_u32(cipher, 1)?,
        read_u32(cipher, 5)?,
        read_u32(cipher, 9)?,
    );
    params
        .validate()
        .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;

    Ok((cipher[SALT_OFFSET..WRAP_NONCE_OFFSET].to_vec(), params))
}

/// Decrypt an envelope with the master password.
///
/// Derives key material from the salt and parameters stored in the header,
/// then unwraps the KGK and the payload.
pub fn decode(password: &[u8], cipher: &[u8], use_compression: bool) -> Result<Decoded> {
    let (salt, params) = read_header(cipher)?;
    let keys = kdf::derive_key(password, &salt, &params)?;
    decode_with_keys(&keys, cipher, use_compression)
}

/// Decrypt an envelope with already derived key material.
pub fn decode_with_keys(keys: &KeyMaterial, cipher: &[u8], use_compression: bool) -> Result<Decoded> {
    if !keys.is_valid() {
        error!("Refusing to decode: master key or IV not derived");
        return Err(CryptoError::MissingKeyMaterial);
    }
    read_header(cipher)?;

    let wrap_cipher = Aes256Gcm::new_from_slice(keys.key().as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: kdf::KEY_SIZE,
            got: keys.key().len(),
        })?;
    let wrap_nonce = Nonce::from_slice(&cipher[WRAP_NONCE_OFFSET..WRAPPED_OFFSET]);
    let secrets = wrap_cipher
        .decrypt(
            wrap_nonce,
            Payload {
                msg: &cipher[WRAPPED_OFFSET..DATA_NONCE_OFFSET],
                aad: keys.iv().as_bytes(),
            },
        )
        .map(SecureBuffer::new)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let (data_key, kgk) = secrets.as_bytes().split_at(DATA_KEY_SIZE);
    let data_cipher = Aes256Gcm::new_from_slice(data_key).map_err(|_| CryptoError::AuthenticationFailed)?;
    let data_nonce = Nonce::from_slice(&cipher[DATA_NONCE_OFFSET..HEADER_SIZE]);
    let body = data_cipher
        .decrypt(data_nonce, &cipher[HEADER_SIZE..])
        .map(SecureBuffer::new)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let payload = if use_compression {
        SecureBuffer::new(decompress(body.as_bytes())?)
    } else {
        body
    };

    Ok(Decoded {
        payload,
        kgk: SecureBuffer::from_slice(kgk),
    })
}

/// [`decode`] on the blocking pool.
pub async fn decode_async(
    password: SecureBuffer,
    cipher: Vec<u8>,
    use_compression: bool,
) -> Result<Decoded> {
    tokio::task::spawn_blocking(move || decode(password.as_bytes(), &cipher, use_compression))
        .await
        .map_err(|e| CryptoError::DecryptionFailed(format!("Decode task failed: {}", e)))?
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let raw: [u8; 4] = bytes[offset..offset + 4]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("Truncated header".to_string()))?;
    Ok(u32::from_le_bytes(raw))
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CryptoError::CompressionFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CryptoError::CompressionFailed(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::CompressionFailed(e.to_string()))?;
    Ok(out)
}

//! Secret containers.
//!
//! [`SecureBuffer`] holds the master password, the KGK and derived key
//! material. Its contents are overwritten with zeros on [`SecureBuffer::invalidate`]
//! and again on drop.

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Sensitive bytes, erased on drop
#[derive(Clone, Default, ZeroizeOnDrop)]
pub struct SecureBuffer {
    data: Vec<u8>,
}

impl SecureBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Take ownership of a string's bytes without copying them.
    pub fn from_string(secret: String) -> Self {
        Self::new(secret.into_bytes())
    }

    /// `len` bytes from the OS random source
    pub fn random(len: usize) -> Self {
        let mut data = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut data);
        Self { data }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// False once invalidated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Append bytes. Reserve capacity first: a reallocation leaves the old
    /// allocation unerased.
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Interpret the contents as UTF-8, if they are.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Overwrite the contents with zeros and mark the buffer empty
    pub fn invalidate(&mut self) {
        self.data.zeroize();
    }

    /// Replace the contents, erasing the previous material first
    pub fn replace(&mut self, data: Vec<u8>) {
        self.invalidate();
        self.data = data;
    }

    /// Constant-time comparison of two buffers
    pub fn ct_eq(&self, other: &SecureBuffer) -> bool {
        self.data.len() == other.data.len() && bool::from(self.data.ct_eq(&other.data))
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<String> for SecureBuffer {
    fn from(secret: String) -> Self {
        Self::from_string(secret)
    }
}

impl From<&str> for SecureBuffer {
    fn from(secret: &str) -> Self {
        Self::from_slice(secret.as_bytes())
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBuffer({} bytes)", self.data.len())
    }
}

//! Deterministic password generation.
//!
//! A domain's password is never stored. It is recomputed from the KGK and
//! the record's parameters:
//!
//! 1. PBKDF2-HMAC-SHA512 over `domain ‖ user ‖ kgk` with the record's salt
//!    and iteration count gives a 64-byte digest.
//! 2. The digest is read as one big-endian integer. For each template
//!    position the integer is divided by the size of that position's
//!    character class and the remainder selects the character.
//!
//! Template grammar: an optional `"<version>;"` prefix followed by one
//! character per output position:
//!
//! | char | class |
//! |---|---|
//! | `n` | digits |
//! | `a` | lowercase letters |
//! | `A` | uppercase letters |
//! | `o` | the record's extra characters |
//! | `x` | union of the classes used in the template, or `usedCharacters` |

use crate::crypto::crypter::KGK_SIZE;
use crate::crypto::{CryptoError, Result, SecureBuffer};
use crate::domain::DomainSettings;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;

pub const DIGITS: &str = "0123456789";
pub const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
pub const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const DEFAULT_EXTRA_CHARACTERS: &str = "#!\"$%&/()[]{}=-_+*<>;:.";

/// Version written in front of templates built by [`make_template`]
pub const TEMPLATE_VERSION: u32 = 1;

const DIGEST_SIZE: usize = 64;

/// Computes the password for a domain record.
pub trait PasswordGenerator: Send + Sync {
    fn generate(&self, kgk: &SecureBuffer, settings: &DomainSettings) -> Result<String>;
}

/// Template-driven PBKDF2 generator
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateGenerator;

impl PasswordGenerator for TemplateGenerator {
    fn generate(&self, kgk: &SecureBuffer, settings: &DomainSettings) -> Result<String> {
        if settings.is_legacy() {
            return Ok(settings.legacy_password.clone());
        }
        if kgk.len() != KGK_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KGK_SIZE,
                got: kgk.len(),
            });
        }
        if settings.iterations == 0 {
            return Err(CryptoError::PasswordGeneration(
                "Iteration count must be positive".to_string(),
            ));
        }

        let template = strip_version(&settings.password_template);
        if template.is_empty() {
            return Err(CryptoError::PasswordGeneration("Empty password template".to_string()));
        }

        let salt = STANDARD
            .decode(settings.salt.as_bytes())
            .map_err(|e| CryptoError::PasswordGeneration(format!("Invalid salt: {}", e)))?;

        let mut input = SecureBuffer::new(Vec::with_capacity(
            settings.domain_name.len() + settings.user_name.len() + kgk.len(),
        ));
        input.extend_from_slice(settings.domain_name.as_bytes());
        input.extend_from_slice(settings.user_name.as_bytes());
        input.extend_from_slice(kgk.as_bytes());

        let mut digest = SecureBuffer::new(vec![0u8; DIGEST_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha512>(input.as_bytes(), &salt, settings.iterations, digest.as_mut_bytes());

        let extras: Vec<char> = if settings.extra_characters.is_empty() {
            DEFAULT_EXTRA_CHARACTERS.chars().collect()
        } else {
            settings.extra_characters.chars().collect()
        };
        let union = union_class(template, &extras, &settings.used_characters);

        let mut password = String::with_capacity(template.len());
        for slot in template.chars() {
            let class: Vec<char> = match slot {
                'n' => DIGITS.chars().collect(),
                'a' => LOWERCASE.chars().collect(),
                'A' => UPPERCASE.chars().collect(),
                'o' => extras.clone(),
                'x' => union.clone(),
                other => {
                    return Err(CryptoError::PasswordGeneration(format!(
                        "Unknown template character '{}'",
                        other
                    )))
                }
            };
            if class.is_empty() {
                return Err(CryptoError::PasswordGeneration(format!(
                    "Empty character class for '{}'",
                    slot
                )));
            }
            let index = divmod(digest.as_mut_bytes(), class.len() as u32);
            password.push(class[index as usize]);
        }

        Ok(password)
    }
}

/// Character classes enabled for a new template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateClasses {
    pub digits: bool,
    pub lowercase: bool,
    pub uppercase: bool,
    pub extras: bool,
}

impl Default for TemplateClasses {
    fn default() -> Self {
        Self {
            digits: true,
            lowercase: true,
            uppercase: true,
            extras: true,
        }
    }
}

impl TemplateClasses {
    fn slots(&self) -> Vec<char> {
        let mut slots = Vec::with_capacity(4);
        if self.lowercase {
            slots.push('a');
        }
        if self.uppercase {
            slots.push('A');
        }
        if self.digits {
            slots.push('n');
        }
        if self.extras {
            slots.push('o');
        }
        slots
    }
}

/// Build a versioned template of `length` positions.
///
/// Every enabled class is guaranteed one position; the rest draw from the
/// union.
pub fn make_template(length: usize, classes: TemplateClasses) -> Result<String> {
    let slots = classes.slots();
    if slots.is_empty() {
        return Err(CryptoError::PasswordGeneration(
            "At least one character class must be enabled".to_string(),
        ));
    }
    if length < slots.len() {
        return Err(CryptoError::PasswordGeneration(format!(
            "Length {} cannot hold {} character classes",
            length,
            slots.len()
        )));
    }

    let mut template = format!("{};", TEMPLATE_VERSION);
    template.extend(slots.iter());
    template.extend(std::iter::repeat('x').take(length - slots.len()));
    Ok(template)
}

/// Random per-domain salt, base64 encoded
pub fn generate_domain_salt(len: usize) -> String {
    let mut salt = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    STANDARD.encode(salt)
}

/// Fresh random key generation key
pub fn generate_kgk() -> SecureBuffer {
    SecureBuffer::random(KGK_SIZE)
}

fn strip_version(template: &str) -> &str {
    match template.split_once(';') {
        Some((_, rest)) => rest,
        None => template,
    }
}

fn union_class(template: &str, extras: &[char], used_characters: &str) -> Vec<char> {
    if !used_characters.is_empty() {
        return used_characters.chars().collect();
    }

    let mut present: Vec<char> = template.chars().filter(|c| *c != 'x').collect();
    if present.is_empty() {
        present = vec!['a', 'A', 'n', 'o'];
    }

    let mut union = Vec::new();
    for (slot, chars) in [
        ('a', LOWERCASE.chars().collect::<Vec<_>>()),
        ('A', UPPERCASE.chars().collect()),
        ('n', DIGITS.chars().collect()),
        ('o', extras.to_vec()),
    ] {
        if present.contains(&slot) {
            union.extend(chars);
        }
    }
    union
}

/// Divide the big-endian integer in `number` by `divisor` in place and
/// return the remainder.
fn divmod(number: &mut [u8], divisor: u32) -> u32 {
    let mut remainder: u32 = 0;
    for byte in number.iter_mut() {
        let acc = (remainder << 8) | u32::from(*byte);
        *byte = (acc / divisor) as u8;
        remainder = acc % divisor;
    }
    remainder
}

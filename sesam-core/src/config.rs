//! Application configuration.

use crate::crypto::{KdfParams, TemplateClasses};
use crate::platform;
use crate::{Result, SesamError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SesamConfig {
    /// JSON settings file holding the encrypted `sync/*` entries
    pub settings_path: PathBuf,

    /// Argon2id parameters for newly written envelopes
    pub kdf: KdfParams,

    /// PBKDF2 iterations for new domains
    pub default_iterations: u32,

    pub default_password_length: usize,

    /// Per-domain salt length in bytes
    pub salt_length: usize,

    pub default_template_classes: TemplateClasses,
}

impl Default for SesamConfig {
    fn default() -> Self {
        Self {
            settings_path: platform::get_default_settings_path(),
            kdf: KdfParams::default(),
            default_iterations: 4096,
            default_password_length: 16,
            salt_length: 16,
            default_template_classes: TemplateClasses::default(),
        }
    }
}

impl SesamConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SesamError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SesamError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.kdf
            .validate()
            .map_err(|e| SesamError::Config(e.to_string()))?;
        if self.default_iterations == 0 {
            return Err(SesamError::Config(
                "default_iterations must be positive".to_string(),
            ));
        }
        if self.salt_length == 0 {
            return Err(SesamError::Config("salt_length must be positive".to_string()));
        }
        if self.default_password_length == 0 {
            return Err(SesamError::Config(
                "default_password_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

//! Persisted settings backend.
//!
//! Settings are flat string key/value pairs. The vault stores its two
//! encrypted entries under [`SYNC_DOMAINS`] and [`SYNC_PARAM`] as base64 text.

use crate::Result;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Encrypted domain store
pub const SYNC_DOMAINS: &str = "sync/domains";

/// Encrypted sync configuration
pub const SYNC_PARAM: &str = "sync/param";

/// Prefix shared by every sync-related entry
pub const SYNC_PREFIX: &str = "sync/";

/// Key/value persistence used by the vault.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: String);

    fn remove(&mut self, key: &str);

    fn keys(&self) -> Vec<String>;

    /// Make all changes durable.
    fn flush(&mut self) -> Result<()>;

    /// Remove every entry whose key starts with `prefix`.
    fn remove_prefix(&mut self, prefix: &str) {
        for key in self.keys() {
            if key.starts_with(prefix) {
                self.remove(&key);
            }
        }
    }
}

/// Settings kept only in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: BTreeMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Settings stored as a JSON object in a single file.
///
/// [`flush`](SettingsStore::flush) writes a temporary file next to the
/// target and renames it over the old one.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileSettings {
    /// Open the settings file. A missing file starts out empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read(&path)?;
            serde_json::from_slice(&content)?
        } else {
            BTreeMap::new()
        };
        debug!("Opened settings {} ({} entries)", path.display(), values.len());
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    fn flush(&mut self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&self.values)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// In-memory settings whose flush can be made to fail.
#[cfg(test)]
pub(crate) struct UnreliableSettings {
    inner: MemorySettings,
    failing: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl UnreliableSettings {
    /// The store and the switch that makes its flushes fail.
    pub(crate) fn new() -> (Self, std::sync::Arc<std::sync::atomic::AtomicBool>) {
        let failing = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let settings = Self {
            inner: MemorySettings::new(),
            failing: std::sync::Arc::clone(&failing),
        };
        (settings, failing)
    }
}

#[cfg(test)]
impl SettingsStore for UnreliableSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: String) {
        self.inner.set(key, value)
    }

    fn remove(&mut self, key: &str) {
        self.inner.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn flush(&mut self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_settings() {
        let mut settings = MemorySettings::new();
        settings.set(SYNC_DOMAINS, "abc".to_string());
        assert_eq!(settings.get(SYNC_DOMAINS).as_deref(), Some("abc"));

        settings.remove(SYNC_DOMAINS);
        assert!(settings.get(SYNC_DOMAINS).is_none());
    }

    #[test]
    fn test_remove_prefix() {
        let mut settings = MemorySettings::new();
        settings.set(SYNC_DOMAINS, "a".to_string());
        settings.set(SYNC_PARAM, "b".to_string());
        settings.set("misc/saltLength", "16".to_string());

        settings.remove_prefix(SYNC_PREFIX);
        assert_eq!(settings.keys(), vec!["misc/saltLength"]);
    }

    #[test]
    fn test_json_file_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = JsonFileSettings::open(&path).unwrap();
        assert!(settings.keys().is_empty());
        settings.set(SYNC_PARAM, "cGFyYW0=".to_string());
        settings.flush().unwrap();

        let reopened = JsonFileSettings::open(&path).unwrap();
        assert_eq!(reopened.get(SYNC_PARAM).as_deref(), Some("cGFyYW0="));
    }

    #[test]
    fn test_unflushed_changes_not_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = JsonFileSettings::open(&path).unwrap();
        settings.set(SYNC_DOMAINS, "x".to_string());

        let reopened = JsonFileSettings::open(&path).unwrap();
        assert!(reopened.get(SYNC_DOMAINS).is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(JsonFileSettings::open(&path).is_err());
    }
}

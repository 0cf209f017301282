//! Sync configuration, stored encrypted under `sync/param`.

use crate::{Result, SesamError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_ROOT: &str = "https://syncserver.net/ctSESAM";
pub const DEFAULT_WRITE_URL: &str = "/ajax/write.php";
pub const DEFAULT_READ_URL: &str = "/ajax/read.php";
pub const DEFAULT_DELETE_URL: &str = "/ajax/delete.php";

/// Peer URLs, credentials and switches for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(rename = "sync/server/root")]
    pub server_root: String,

    #[serde(rename = "sync/server/username")]
    pub server_username: String,

    #[serde(rename = "sync/server/password")]
    pub server_password: String,

    /// PEM bundle of trusted root certificates. Empty means the built-in roots.
    #[serde(rename = "sync/server/rootCertificates")]
    pub root_certificates: String,

    /// Reject servers whose certificate does not verify
    #[serde(rename = "sync/server/secure")]
    pub server_secure: bool,

    #[serde(rename = "sync/server/writeUrl")]
    pub write_url: String,

    #[serde(rename = "sync/server/readUrl")]
    pub read_url: String,

    #[serde(rename = "sync/server/deleteUrl")]
    pub delete_url: String,

    #[serde(rename = "sync/onStart")]
    pub sync_on_start: bool,

    #[serde(rename = "sync/filename")]
    pub sync_file: String,

    #[serde(rename = "sync/useFile")]
    pub use_sync_file: bool,

    #[serde(rename = "sync/useServer")]
    pub use_sync_server: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_root: DEFAULT_SERVER_ROOT.to_string(),
            server_username: String::new(),
            server_password: String::new(),
            root_certificates: String::new(),
            server_secure: true,
            write_url: DEFAULT_WRITE_URL.to_string(),
            read_url: DEFAULT_READ_URL.to_string(),
            delete_url: DEFAULT_DELETE_URL.to_string(),
            sync_on_start: true,
            sync_file: String::new(),
            use_sync_file: false,
            use_sync_server: false,
        }
    }
}

impl SyncConfig {
    /// Parse the decrypted `sync/param` payload.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SesamError::MalformedPayload(format!("Sync configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// True when at least one peer is switched on.
    pub fn any_peer_enabled(&self) -> bool {
        self.use_sync_file || self.use_sync_server
    }

    pub fn write_endpoint(&self) -> String {
        join_url(&self.server_root, &self.write_url)
    }

    pub fn read_endpoint(&self) -> String {
        join_url(&self.server_root, &self.read_url)
    }

    pub fn delete_endpoint(&self) -> String {
        join_url(&self.server_root, &self.delete_url)
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_sync_file && self.sync_file.is_empty() {
            return Err(SesamError::Config("Sync file enabled but no filename set".to_string()));
        }
        if self.use_sync_server && self.server_root.is_empty() {
            return Err(SesamError::Config("Sync server enabled but no root URL set".to_string()));
        }
        Ok(())
    }
}

fn join_url(root: &str, path: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

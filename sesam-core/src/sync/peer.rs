//! Sync peers: places that hold a copy of the encrypted domain store.
//!
//! A peer only moves opaque envelope bytes. Decoding and merging happen in
//! the engine.

use crate::sync::SyncConfig;
use crate::{Result, SesamError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which kind of peer, in sync order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerKind {
    File,
    Server,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::File => write!(f, "file"),
            PeerKind::Server => write!(f, "server"),
        }
    }
}

/// A remote copy of the encrypted domain store.
#[async_trait]
pub trait SyncPeer: Send + Sync {
    fn kind(&self) -> PeerKind;

    /// Human-readable location for logs and messages.
    fn describe(&self) -> String;

    /// Read the peer's envelope. `None` means the peer holds nothing yet.
    async fn fetch(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the peer's envelope.
    async fn store(&self, cipher: &[u8]) -> Result<()>;

    /// Remove the peer's copy entirely.
    async fn delete(&self) -> Result<()>;
}

/// The sync file: raw envelope bytes, read and written whole.
#[derive(Debug, Clone)]
pub struct FilePeer {
    path: PathBuf,
}

impl FilePeer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SyncPeer for FilePeer {
    fn kind(&self) -> PeerKind {
        PeerKind::File
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => {
                debug!("{} is empty", self.path.display());
                Ok(None)
            }
            Ok(bytes) => {
                debug!("Read {} bytes from {}", bytes.len(), self.path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SesamError::PeerUnavailable(format!(
                "Cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn store(&self, cipher: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let write = async {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(&tmp, cipher).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            SesamError::PeerUnavailable(format!("Cannot write {}: {}", self.path.display(), e))
        })?;
        debug!("Wrote {} bytes to {}", cipher.len(), self.path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SesamError::PeerUnavailable(format!(
                "Cannot remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// The sync server: form-encoded POSTs answered with a JSON status envelope.
#[cfg(feature = "sync")]
pub struct ServerPeer {
    client: reqwest::Client,
    read_url: String,
    write_url: String,
    delete_url: String,
    username: String,
    password: String,
}

#[cfg(feature = "sync")]
#[derive(Debug, serde::Deserialize)]
struct ServerResponse {
    status: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(feature = "sync")]
impl ServerPeer {
    /// Build a peer from the sync configuration.
    ///
    /// A non-empty `root_certificates` PEM bundle replaces the built-in
    /// trust anchors.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("sesam/", env!("CARGO_PKG_VERSION")));

        if !config.root_certificates.trim().is_empty() {
            let certs = reqwest::Certificate::from_pem_bundle(config.root_certificates.as_bytes())
                .map_err(|e| SesamError::Config(format!("Invalid root certificates: {}", e)))?;
            builder = builder.tls_built_in_root_certs(false);
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if !config.server_secure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| SesamError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            read_url: config.read_endpoint(),
            write_url: config.write_endpoint(),
            delete_url: config.delete_endpoint(),
            username: config.server_username.clone(),
            password: config.server_password.clone(),
        })
    }

    async fn post(&self, url: &str, data: Option<String>) -> Result<ServerResponse> {
        let mut request = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(data) = data {
            request = request.form(&[("data", data)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SesamError::PeerUnavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(SesamError::PeerUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| SesamError::PeerUnavailable(format!("{}: {}", url, e)))?;
        let parsed: ServerResponse = serde_json::from_slice(&body)
            .map_err(|e| SesamError::PeerUnavailable(format!("{}: invalid response: {}", url, e)))?;

        if parsed.status != "ok" {
            return Err(SesamError::PeerUnavailable(
                parsed
                    .error
                    .unwrap_or_else(|| format!("server status '{}'", parsed.status)),
            ));
        }
        Ok(parsed)
    }
}

#[cfg(feature = "sync")]
#[async_trait]
impl SyncPeer for ServerPeer {
    fn kind(&self) -> PeerKind {
        PeerKind::Server
    }

    fn describe(&self) -> String {
        self.read_url.clone()
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let response = self.post(&self.read_url, None).await?;
        match response.result.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| SesamError::MalformedPayload(format!("Server result is not base64: {}", e))),
        }
    }

    async fn store(&self, cipher: &[u8]) -> Result<()> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        self.post(&self.write_url, Some(STANDARD.encode(cipher))).await?;
        debug!("Uploaded {} bytes to {}", cipher.len(), self.write_url);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.post(&self.delete_url, None).await?;
        Ok(())
    }
}

/// Peers enabled in `config`, file first.
pub fn peers_from_config(config: &SyncConfig) -> Result<Vec<Box<dyn SyncPeer>>> {
    let mut peers: Vec<Box<dyn SyncPeer>> = Vec::new();
    if config.use_sync_file && !config.sync_file.is_empty() {
        peers.push(Box::new(FilePeer::new(&config.sync_file)));
    }
    if config.use_sync_server {
        #[cfg(feature = "sync")]
        peers.push(Box::new(ServerPeer::from_config(config)?));
        #[cfg(not(feature = "sync"))]
        tracing::warn!("Sync server enabled but built without the `sync` feature");
    }
    Ok(peers)
}

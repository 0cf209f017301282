//! Sync engine: drives one fetch/decode/merge/write cycle per peer.
//!
//! The vault lock is held from decoding until the merged state is committed,
//! so readers never see a half-merged store. Every failure before the commit
//! leaves the vault exactly as it was.

use crate::crypto::SecureBuffer;
use crate::domain::DomainSettingsList;
use crate::sync::merge::{merge, MergeResult};
use crate::sync::peer::{peers_from_config, PeerKind, SyncPeer};
use crate::vault::Vault;
use crate::{Result, SesamError};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Where a sync cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    FetchingRemote,
    Decoding,
    Merging,
    WritingRemote,
    PersistingLocal,
}

/// What one sync cycle against one peer did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub peer: PeerKind,

    /// The peer had no data and was initialized.
    pub bootstrapped: bool,

    /// The peer brought a different KGK, which is now active locally.
    pub kgk_replaced: bool,

    pub local_changed: bool,

    pub remote_changed: bool,

    /// Domains frozen into legacy records because of a KGK change.
    pub converted: Vec<String>,
}

/// Aborts an in-flight sync while it waits on the peer.
///
/// A cancel stays in effect until the next `sync_with` or `sync_all` call.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Orchestrates sync cycles for one vault.
pub struct SyncEngine {
    vault: Arc<Mutex<Vault>>,
    phase: watch::Sender<SyncPhase>,
    cancel: Arc<watch::Sender<bool>>,
}

impl SyncEngine {
    pub fn new(vault: Arc<Mutex<Vault>>) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            vault,
            phase,
            cancel: Arc::new(cancel),
        }
    }

    /// Follow phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    /// Sync with every enabled peer, file first.
    ///
    /// A failing peer does not stop the others. A credential error does,
    /// since every later peer would fail the same way.
    pub async fn sync_all(&self) -> Result<Vec<(PeerKind, Result<SyncOutcome>)>> {
        let peers = self.configured_peers().await?;
        self.cancel.send_replace(false);
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            let result = self.sync_once(peer.as_ref()).await;
            let stop = matches!(
                &result,
                Err(e) if e.is_credential_error() || matches!(e, SesamError::Cancelled)
            );
            results.push((peer.kind(), result));
            if stop {
                break;
            }
        }
        Ok(results)
    }

    /// Run one full sync cycle against `peer`.
    pub async fn sync_with(&self, peer: &dyn SyncPeer) -> Result<SyncOutcome> {
        self.cancel.send_replace(false);
        self.sync_once(peer).await
    }

    async fn sync_once(&self, peer: &dyn SyncPeer) -> Result<SyncOutcome> {
        let result = self.run_cycle(peer).await;
        if let Err(e) = &result {
            error!("Sync with {} failed: {}", peer.describe(), e);
        }
        self.set_phase(SyncPhase::Idle);
        result
    }

    async fn run_cycle(&self, peer: &dyn SyncPeer) -> Result<SyncOutcome> {
        let mut cancelled = self.cancel.subscribe();

        self.set_phase(SyncPhase::FetchingRemote);
        let fetched = tokio::select! {
            fetched = peer.fetch() => fetched?,
            _ = wait_cancelled(&mut cancelled) => {
                warn!("Sync with {} cancelled", peer.describe());
                return Err(SesamError::Cancelled);
            }
        };

        let mut vault = self.vault.lock().await;
        let local_kgk = vault.kgk()?.clone();

        self.set_phase(SyncPhase::Decoding);
        let bootstrapped = fetched.is_none();
        let (peer_domains, remote_kgk) = match fetched {
            Some(cipher) => {
                let decoded = vault.decode(cipher).await?;
                let domains = DomainSettingsList::from_json(decoded.payload.as_bytes())?;
                (domains, decoded.kgk)
            }
            None => {
                info!("{} holds no data, initializing it", peer.describe());
                (DomainSettingsList::new(), local_kgk.clone())
            }
        };

        let kgk_replaced = !remote_kgk.ct_eq(&local_kgk);
        let legacy_kgk: Option<SecureBuffer> = if kgk_replaced && !vault.domains()?.is_empty() {
            warn!("Peer KGK differs, freezing local domains into legacy passwords");
            Some(local_kgk.clone())
        } else {
            None
        };

        self.set_phase(SyncPhase::Merging);
        let MergeResult {
            local,
            remote,
            converted,
        } = merge(
            vault.domains()?,
            &peer_domains,
            legacy_kgk.as_ref(),
            vault.generator().as_ref(),
        )?;
        let local_changed = local.is_dirty();
        let remote_changed = remote.is_dirty();

        if remote_changed || bootstrapped {
            self.set_phase(SyncPhase::WritingRemote);
            let cipher = vault.encode_with_kgk(&remote_kgk, &remote.to_json()?)?;
            tokio::select! {
                stored = peer.store(&cipher) => stored?,
                _ = wait_cancelled(&mut cancelled) => {
                    warn!("Sync with {} cancelled while writing", peer.describe());
                    return Err(SesamError::Cancelled);
                }
            }
        }

        self.set_phase(SyncPhase::PersistingLocal);
        vault.commit_merge(local, remote_kgk).await?;

        info!(
            "Synced with {}: local {}, remote {}",
            peer.describe(),
            if local_changed { "updated" } else { "unchanged" },
            if remote_changed { "updated" } else { "unchanged" },
        );

        Ok(SyncOutcome {
            peer: peer.kind(),
            bootstrapped,
            kgk_replaced,
            local_changed,
            remote_changed,
            converted,
        })
    }

    /// Overwrite `peer` with the full local store, without fetching or merging.
    pub async fn force_push(&self, peer: &dyn SyncPeer) -> Result<()> {
        let vault = self.vault.lock().await;
        self.set_phase(SyncPhase::WritingRemote);
        let result = async {
            let cipher = vault.encode_domains(vault.domains()?)?;
            peer.store(&cipher).await
        }
        .await;
        self.set_phase(SyncPhase::Idle);
        if result.is_ok() {
            info!("Pushed local store to {}", peer.describe());
        }
        result
    }

    /// Force-push to every enabled peer, or only to `only` when given.
    pub async fn force_push_all(&self, only: Option<PeerKind>) -> Result<usize> {
        let peers = self.configured_peers().await?;
        let mut pushed = 0;
        for peer in peers.iter().filter(|p| only.map_or(true, |k| p.kind() == k)) {
            self.force_push(peer.as_ref()).await?;
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Remove the remote copies: delete the sync file and ask the server to
    /// drop its data.
    pub async fn delete_remote(&self) -> Result<()> {
        for peer in self.configured_peers().await? {
            peer.delete().await?;
            info!("Deleted remote data at {}", peer.describe());
        }
        Ok(())
    }

    async fn configured_peers(&self) -> Result<Vec<Box<dyn SyncPeer>>> {
        let vault = self.vault.lock().await;
        peers_from_config(vault.sync_config())
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

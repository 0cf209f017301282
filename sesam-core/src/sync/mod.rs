//! Synchronization of the domain store with sync peers.
//!
//! - Whole-store exchange: each peer holds one envelope of the full store
//! - Last-write-wins merge on each record's modification date
//! - Tombstone-based deletes
//! - Legacy conversion of local records when a peer brings another KGK

pub mod config;
pub mod engine;
pub mod merge;
pub mod peer;

pub use config::SyncConfig;
pub use engine::{CancelHandle, SyncEngine, SyncOutcome, SyncPhase};
pub use merge::{merge, ConflictResolver, MergeResult, Resolution};
#[cfg(feature = "sync")]
pub use peer::ServerPeer;
pub use peer::{peers_from_config, FilePeer, PeerKind, SyncPeer};

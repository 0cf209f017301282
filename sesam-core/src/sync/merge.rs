//! Three-way reconciliation of the local store with a peer's store.
//!
//! The merge never mutates its inputs. It works on copies and hands back
//! both converged halves, so a failure at any later stage leaves the
//! caller's state exactly as it was.

use crate::crypto::{PasswordGenerator, SecureBuffer};
use crate::domain::{alternative_domain_name, DomainSettings, DomainSettingsList};
use crate::Result;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The remote record is newer.
    AcceptRemote,
    /// The local record is newer.
    KeepLocal,
    /// Same modification date: nothing to do.
    InSync,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Last-writer-wins on `modified_date`. A missing date is older than any date.
    pub fn resolve(local: &DomainSettings, remote: &DomainSettings) -> Resolution {
        match remote.modified_date.cmp(&local.modified_date) {
            std::cmp::Ordering::Greater => Resolution::AcceptRemote,
            std::cmp::Ordering::Less => Resolution::KeepLocal,
            std::cmp::Ordering::Equal => Resolution::InSync,
        }
    }
}

/// Both converged stores after a merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The new local store. Dirty iff it differs from the input.
    pub local: DomainSettingsList,

    /// What to write back to the peer. Dirty iff it differs from the input.
    pub remote: DomainSettingsList,

    /// Names of records frozen into legacy records because the KGK changed,
    /// as stored after renaming.
    pub converted: Vec<String>,
}

impl MergeResult {
    pub fn local_changed(&self) -> bool {
        self.local.is_dirty()
    }

    pub fn remote_changed(&self) -> bool {
        self.remote.is_dirty()
    }
}

/// Merge `local` and `remote`.
///
/// `legacy_kgk` is the KGK that was active before this sync when the peer
/// brought a different one and the local store was not empty. Every local
/// record that is about to be pushed is then frozen into a legacy record
/// under that old KGK.
pub fn merge(
    local: &DomainSettingsList,
    remote: &DomainSettingsList,
    legacy_kgk: Option<&SecureBuffer>,
    generator: &dyn PasswordGenerator,
) -> Result<MergeResult> {
    let mut merged_local = local.clone();
    merged_local.set_dirty(false);
    let mut merged_remote = remote.clone();
    merged_remote.set_dirty(false);
    let mut converted = Vec::new();

    let mut names: BTreeSet<String> = local.key_set();
    names.extend(remote.key_set());

    for name in &names {
        match (local.get(name), remote.get(name)) {
            (Some(l), Some(r)) => match ConflictResolver::resolve(l, r) {
                Resolution::AcceptRemote => {
                    debug!("{}: remote is newer", l.domain_name);
                    merged_local.update_with(r.clone());
                }
                // A newer local record loses to the peer's when the KGK is
                // being replaced: its password only exists under the old KGK,
                // so it survives as a renamed legacy copy instead.
                Resolution::KeepLocal => match legacy_kgk {
                    Some(kgk) if !l.deleted => {
                        let frozen =
                            freeze_renamed(l, kgk, generator, &merged_local, &merged_remote)?;
                        converted.push(frozen.domain_name.clone());
                        merged_remote.update_with(frozen.clone());
                        merged_local.update_with(frozen);
                        merged_local.update_with(r.clone());
                    }
                    _ => {
                        debug!("{}: local is newer", l.domain_name);
                        merged_remote.update_with(l.clone());
                    }
                },
                Resolution::InSync => match legacy_kgk {
                    Some(kgk) if !l.deleted && !l.is_legacy() && !same_parameters(l, r) => {
                        debug!("{}: diverged with equal dates", l.domain_name);
                        let frozen =
                            freeze_renamed(l, kgk, generator, &merged_local, &merged_remote)?;
                        converted.push(frozen.domain_name.clone());
                        merged_remote.update_with(frozen.clone());
                        merged_local.update_with(frozen);
                        merged_local.update_with(r.clone());
                    }
                    Some(_) if !l.deleted && !l.is_legacy() && r.is_legacy() => {
                        debug!("{}: peer already holds the legacy copy", l.domain_name);
                        merged_local.update_with(r.clone());
                    }
                    _ => {}
                },
            },
            (Some(l), None) => {
                if l.deleted {
                    debug!("{}: dropping tombstone unknown to peer", l.domain_name);
                    merged_local.remove(name);
                } else if let Some(kgk) = legacy_kgk {
                    let frozen = to_legacy(l, kgk, generator)?;
                    converted.push(frozen.domain_name.clone());
                    merged_local.update_with(frozen.clone());
                    merged_remote.update_with(frozen);
                } else {
                    merged_remote.update_with(l.clone());
                }
            }
            (None, Some(r)) => {
                merged_local.update_with(r.clone());
            }
            (None, None) => {}
        }
    }

    Ok(MergeResult {
        local: merged_local,
        remote: merged_remote,
        converted,
    })
}

/// Legacy copy of `ds` under a name free on both sides.
fn freeze_renamed(
    ds: &DomainSettings,
    kgk: &SecureBuffer,
    generator: &dyn PasswordGenerator,
    local: &DomainSettingsList,
    remote: &DomainSettingsList,
) -> Result<DomainSettings> {
    let mut frozen = to_legacy(ds, kgk, generator)?;
    let mut taken = local.key_set();
    taken.extend(remote.key_set());
    frozen.domain_name = alternative_domain_name(&ds.domain_name, &taken);
    info!(
        "{}: frozen into legacy record {}",
        ds.domain_name, frozen.domain_name
    );
    Ok(frozen)
}

/// Whether two records generate from the same account and parameters.
fn same_parameters(a: &DomainSettings, b: &DomainSettings) -> bool {
    a.user_name == b.user_name
        && a.salt == b.salt
        && a.iterations == b.iterations
        && a.password_template == b.password_template
        && a.extra_characters == b.extra_characters
        && a.used_characters == b.used_characters
}

/// Copy of `ds` whose password is stored literally, computed under `kgk`.
pub fn to_legacy(
    ds: &DomainSettings,
    kgk: &SecureBuffer,
    generator: &dyn PasswordGenerator,
) -> Result<DomainSettings> {
    let mut frozen = ds.clone();
    if !frozen.is_legacy() {
        frozen.legacy_password = generator.generate(kgk, ds)?;
    }
    Ok(frozen)
}

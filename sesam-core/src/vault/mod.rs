//! Vault session: coordinates crypto, the domain store and persisted settings.
//!
//! Two settings entries are written, both as base64 envelopes that carry
//! the KGK:
//! - `sync/domains`: the domain store as JSON
//! - `sync/param`: the sync configuration as JSON
//!
//! Key material is re-derived under a fresh salt after every save.
//!
//! Every mutation encrypts and flushes the new state before the session
//! adopts it. A failed save leaves the session and the stored entries as
//! they were.

#[cfg(test)]
mod tests;

use crate::{
    config::SesamConfig,
    crypto::{
        self, crypter, kdf, Decoded, KeyMaterial, PasswordGenerator, SecureBuffer,
        TemplateGenerator, COMPRESSION_ENABLED, KGK_SIZE,
    },
    domain::{DomainSettings, DomainSettingsList},
    settings::{SettingsStore, SYNC_DOMAINS, SYNC_PARAM, SYNC_PREFIX},
    sync::{merge::to_legacy, SyncConfig},
    Result, SesamError,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Secrets and data held while the vault is unlocked
struct Session {
    master_password: SecureBuffer,
    kgk: SecureBuffer,
    keys: KeyMaterial,
    domains: DomainSettingsList,
}

impl Session {
    fn invalidate(&mut self) {
        self.master_password.invalidate();
        self.kgk.invalidate();
        self.keys.invalidate();
    }
}

/// An unlockable vault over a settings backend.
pub struct Vault {
    settings: Box<dyn SettingsStore>,
    config: SesamConfig,
    generator: Arc<dyn PasswordGenerator>,
    sync_config: SyncConfig,
    session: Option<Session>,
}

impl Vault {
    pub fn new(settings: Box<dyn SettingsStore>, config: SesamConfig) -> Self {
        Self {
            settings,
            config,
            generator: Arc::new(TemplateGenerator),
            sync_config: SyncConfig::default(),
            session: None,
        }
    }

    /// Replace the password generator.
    pub fn with_generator(mut self, generator: Arc<dyn PasswordGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn config(&self) -> &SesamConfig {
        &self.config
    }

    pub fn generator(&self) -> Arc<dyn PasswordGenerator> {
        Arc::clone(&self.generator)
    }

    /// True when a domain store has been saved before.
    pub fn has_stored_data(&self) -> bool {
        self.settings.get(SYNC_DOMAINS).is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_some()
    }

    /// Restore the session from the persisted settings.
    ///
    /// A wrong password fails with [`SesamError::Credential`] and leaves the
    /// vault locked. Without stored domains a fresh KGK is generated.
    pub async fn unlock(&mut self, master_password: SecureBuffer) -> Result<()> {
        let sync_config = match self.read_entry(SYNC_PARAM)? {
            Some(cipher) => {
                let decoded = crypter::decode_async(
                    master_password.clone(),
                    cipher,
                    COMPRESSION_ENABLED,
                )
                .await?;
                SyncConfig::from_json(decoded.payload.as_bytes())?
            }
            None => SyncConfig::default(),
        };

        let (kgk, domains) = match self.read_entry(SYNC_DOMAINS)? {
            Some(cipher) => {
                let decoded = crypter::decode_async(
                    master_password.clone(),
                    cipher,
                    COMPRESSION_ENABLED,
                )
                .await?;
                let domains = DomainSettingsList::from_json(decoded.payload.as_bytes())?;
                (decoded.kgk, domains)
            }
            None => {
                info!("No stored domains, generating a new KGK");
                (crypto::generate_kgk(), DomainSettingsList::new())
            }
        };

        let keys = kdf::regenerate(master_password.clone(), self.config.kdf).await?;
        info!("Vault unlocked ({} domains)", domains.len());

        self.sync_config = sync_config;
        self.session = Some(Session {
            master_password,
            kgk,
            keys,
            domains,
        });
        Ok(())
    }

    /// Erase every secret and forget the domain store.
    pub fn lock(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.invalidate();
            info!("Vault locked");
        }
    }

    pub fn domains(&self) -> Result<&DomainSettingsList> {
        Ok(&self.session()?.domains)
    }

    pub fn kgk(&self) -> Result<&SecureBuffer> {
        Ok(&self.session()?.kgk)
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    /// A record for `name` prefilled with the configured defaults.
    pub fn new_domain(&self, name: &str) -> Result<DomainSettings> {
        let mut ds = DomainSettings::new(name);
        ds.salt = crypto::generate_domain_salt(self.config.salt_length);
        ds.iterations = self.config.default_iterations;
        ds.password_template = crypto::make_template(
            self.config.default_password_length,
            self.config.default_template_classes,
        )?;
        Ok(ds)
    }

    /// Store a user-edited record and persist the domain store.
    pub async fn save_domain(&mut self, record: DomainSettings) -> Result<()> {
        let record = if record.deleted {
            record.into_tombstone()
        } else {
            record
        };
        let name = record.domain_name.clone();
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        let mut domains = session.domains.clone();
        domains.upsert(record)?;
        write_entries(self.settings.as_mut(), &session.keys, &session.kgk, &domains, None)?;
        self.adopt_domains(domains).await?;
        debug!("Saved {}", name);
        Ok(())
    }

    /// Replace a record with a tombstone so the deletion reaches every peer.
    pub async fn delete_domain(&mut self, name: &str) -> Result<()> {
        let existing = match self.domains()?.get(name) {
            Some(ds) if !ds.deleted => ds.clone(),
            _ => return Err(SesamError::NotFound(name.to_string())),
        };
        self.save_domain(existing.into_tombstone()).await
    }

    /// Add imported records, renaming those whose name is taken.
    pub async fn import_domains(&mut self, records: Vec<DomainSettings>) -> Result<Vec<(String, String)>> {
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        let count = records.len();
        let mut domains = session.domains.clone();
        let renamed = domains.import(records);
        if count > 0 {
            write_entries(self.settings.as_mut(), &session.keys, &session.kgk, &domains, None)?;
            self.adopt_domains(domains).await?;
        }
        info!("Imported {} domains ({} renamed)", count, renamed.len());
        Ok(renamed)
    }

    /// The password for a live domain: its legacy literal or a generated one.
    pub fn password_for(&self, name: &str) -> Result<String> {
        let session = self.session()?;
        match session.domains.get(name) {
            Some(ds) if !ds.deleted => Ok(self.generator.generate(&session.kgk, ds)?),
            _ => Err(SesamError::NotFound(name.to_string())),
        }
    }

    /// Encrypt `payload` together with `kgk` under the current key material.
    pub fn encode_with_kgk(&self, kgk: &SecureBuffer, payload: &[u8]) -> Result<Vec<u8>> {
        let session = self.session()?;
        Ok(crypter::encode(&session.keys, kgk, payload, COMPRESSION_ENABLED)?)
    }

    /// Encrypt a domain store under the session KGK.
    pub fn encode_domains(&self, domains: &DomainSettingsList) -> Result<Vec<u8>> {
        let kgk = self.kgk()?;
        self.encode_with_kgk(kgk, &domains.to_json()?)
    }

    /// Decrypt an envelope with the session master password.
    pub async fn decode(&self, cipher: Vec<u8>) -> Result<Decoded> {
        let password = self.session()?.master_password.clone();
        Ok(crypter::decode_async(password, cipher, COMPRESSION_ENABLED).await?)
    }

    /// Install the result of a merge and persist it.
    ///
    /// Returns whether the KGK changed.
    pub async fn commit_merge(&mut self, domains: DomainSettingsList, kgk: SecureBuffer) -> Result<bool> {
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        let kgk_changed = !session.kgk.ct_eq(&kgk);
        if !domains.is_dirty() && !kgk_changed {
            return Ok(false);
        }

        let sync_config = kgk_changed.then_some(&self.sync_config);
        write_entries(self.settings.as_mut(), &session.keys, &kgk, &domains, sync_config)?;
        if kgk_changed {
            self.session_mut()?.kgk.replace(kgk.as_bytes().to_vec());
        }
        self.adopt_domains(domains).await?;
        Ok(kgk_changed)
    }

    /// Export the KGK as an envelope with an empty JSON payload.
    pub fn export_kgk(&self) -> Result<Vec<u8>> {
        let kgk = self.kgk()?;
        self.encode_with_kgk(kgk, b"{}")
    }

    /// Import a KGK exported by [`export_kgk`](Self::export_kgk).
    ///
    /// `password` is the master password the file was written under.
    pub async fn import_kgk(&mut self, cipher: Vec<u8>, password: SecureBuffer) -> Result<()> {
        self.session()?;
        let decoded = crypter::decode_async(password, cipher, COMPRESSION_ENABLED).await?;
        self.install_kgk(decoded.kgk).await
    }

    /// Make `kgk` the active KGK.
    ///
    /// Live generated records are frozen into legacy records under the old
    /// KGK first. A KGK of the wrong size is rejected with nothing changed.
    pub async fn install_kgk(&mut self, kgk: SecureBuffer) -> Result<()> {
        if kgk.len() != KGK_SIZE {
            return Err(SesamError::InvalidKgk {
                expected: KGK_SIZE,
                got: kgk.len(),
            });
        }
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        if session.kgk.ct_eq(&kgk) {
            return Ok(());
        }

        let mut domains = session.domains.clone();
        let mut frozen = 0;
        for ds in session.domains.iter().filter(|ds| !ds.deleted && !ds.is_legacy()) {
            let mut legacy = to_legacy(ds, &session.kgk, self.generator.as_ref())?;
            legacy.modified_date = Some(Utc::now());
            domains.update_with(legacy);
            frozen += 1;
        }
        if frozen > 0 {
            warn!("Freezing {} domains into legacy passwords", frozen);
        }

        write_entries(
            self.settings.as_mut(),
            &session.keys,
            &kgk,
            &domains,
            Some(&self.sync_config),
        )?;
        self.session_mut()?.kgk.replace(kgk.as_bytes().to_vec());
        self.adopt_domains(domains).await
    }

    /// Re-encrypt everything under a new master password.
    pub async fn change_master_password(&mut self, old: SecureBuffer, new: SecureBuffer) -> Result<()> {
        if new.is_empty() {
            return Err(SesamError::InvalidInput("Master password must not be empty".to_string()));
        }
        let params = self.config.kdf;
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        if !session.master_password.ct_eq(&old) {
            return Err(SesamError::Credential);
        }
        let keys = kdf::regenerate(new.clone(), params).await?;
        write_entries(
            self.settings.as_mut(),
            &keys,
            &session.kgk,
            &session.domains,
            Some(&self.sync_config),
        )?;

        self.session_mut()?
            .master_password
            .replace(new.as_bytes().to_vec());
        info!("Master password changed");
        self.refresh_keys().await
    }

    /// Store a new sync configuration in `sync/param`.
    ///
    /// The domain store is written too, so a fresh vault's KGK is not lost.
    pub async fn save_sync_config(&mut self, sync_config: SyncConfig) -> Result<()> {
        sync_config.validate()?;
        let session = self.session.as_ref().ok_or(SesamError::VaultLocked)?;
        write_entries(
            self.settings.as_mut(),
            &session.keys,
            &session.kgk,
            &session.domains,
            Some(&sync_config),
        )?;
        self.sync_config = sync_config;
        self.refresh_keys().await
    }

    /// Remove every `sync/*` entry and lock the vault.
    pub fn clear_all(&mut self) -> Result<()> {
        self.settings.remove_prefix(SYNC_PREFIX);
        self.settings.flush()?;
        self.sync_config = SyncConfig::default();
        self.lock();
        warn!("All sync settings cleared");
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(SesamError::VaultLocked)
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(SesamError::VaultLocked)
    }

    fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.settings.get(key) {
            Some(text) => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(|e| SesamError::MalformedPayload(format!("{} is not base64: {}", key, e))),
            None => Ok(None),
        }
    }

    /// Take over a store that was just written.
    async fn adopt_domains(&mut self, mut domains: DomainSettingsList) -> Result<()> {
        domains.set_dirty(false);
        self.session_mut()?.domains = domains;
        self.refresh_keys().await
    }

    /// Derive fresh key material for the next save.
    async fn refresh_keys(&mut self) -> Result<()> {
        let params = self.config.kdf;
        let session = self.session_mut()?;
        session.keys = kdf::regenerate(session.master_password.clone(), params).await?;
        debug!(
            "Settings saved, key material regenerated (salt {})",
            kdf::salt_fingerprint(session.keys.salt())
        );
        Ok(())
    }
}

/// Encrypt `domains` and, when given, `sync_config`, then write and flush them.
///
/// If the flush fails the previous values are put back into `settings`.
fn write_entries(
    settings: &mut dyn SettingsStore,
    keys: &KeyMaterial,
    kgk: &SecureBuffer,
    domains: &DomainSettingsList,
    sync_config: Option<&SyncConfig>,
) -> Result<()> {
    let mut entries = Vec::with_capacity(2);
    let cipher = crypter::encode(keys, kgk, &domains.to_json()?, COMPRESSION_ENABLED)?;
    entries.push((SYNC_DOMAINS, STANDARD.encode(cipher)));
    if let Some(sync_config) = sync_config {
        let cipher = crypter::encode(keys, kgk, &sync_config.to_json()?, COMPRESSION_ENABLED)?;
        entries.push((SYNC_PARAM, STANDARD.encode(cipher)));
    }

    let previous: Vec<_> = entries
        .iter()
        .map(|(key, _)| (*key, settings.get(key)))
        .collect();
    for (key, value) in entries {
        settings.set(key, value);
    }
    if let Err(e) = settings.flush() {
        warn!("Saving settings failed, keeping previous state: {}", e);
        for (key, value) in previous {
            match value {
                Some(value) => settings.set(key, value),
                None => settings.remove(key),
            }
        }
        return Err(e);
    }
    Ok(())
}

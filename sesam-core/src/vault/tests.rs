use super::*;
use crate::crypto::KdfParams;
use crate::settings::{JsonFileSettings, MemorySettings, UnreliableSettings};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

const PASSWORD: &str = "test_password_123!";

fn test_config() -> SesamConfig {
    SesamConfig {
        kdf: KdfParams::for_testing(),
        ..Default::default()
    }
}

async fn memory_vault(password: &str) -> Vault {
    let mut vault = Vault::new(Box::new(MemorySettings::new()), test_config());
    vault.unlock(SecureBuffer::from(password)).await.unwrap();
    vault
}

fn file_vault(path: &Path) -> Vault {
    Vault::new(Box::new(JsonFileSettings::open(path).unwrap()), test_config())
}

async fn unreliable_vault(password: &str) -> (Vault, Arc<AtomicBool>) {
    let (settings, failing) = UnreliableSettings::new();
    let mut vault = Vault::new(Box::new(settings), test_config());
    vault.unlock(SecureBuffer::from(password)).await.unwrap();
    (vault, failing)
}

async fn add(vault: &mut Vault, name: &str) -> DomainSettings {
    let mut ds = vault.new_domain(name).unwrap();
    ds.user_name = "user@example.com".to_string();
    vault.save_domain(ds.clone()).await.unwrap();
    ds
}

#[tokio::test]
async fn test_unlock_fresh_vault() {
    let vault = memory_vault(PASSWORD).await;

    assert!(vault.is_unlocked());
    assert!(!vault.has_stored_data());
    assert!(vault.domains().unwrap().is_empty());
    assert_eq!(vault.kgk().unwrap().len(), KGK_SIZE);
}

#[tokio::test]
async fn test_save_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let mut vault = file_vault(&path);
    vault.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();
    add(&mut vault, "Example.com").await;
    let kgk = vault.kgk().unwrap().clone();
    let password = vault.password_for("example.com").unwrap();
    vault.lock();

    let mut reopened = file_vault(&path);
    assert!(reopened.has_stored_data());
    reopened.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();

    assert!(reopened.kgk().unwrap().ct_eq(&kgk));
    let ds = reopened.domains().unwrap().at("example.com");
    assert_eq!(ds.domain_name, "Example.com");
    assert_eq!(ds.user_name, "user@example.com");
    assert!(ds.created_date.is_some());
    assert_eq!(reopened.password_for("EXAMPLE.COM").unwrap(), password);
}

#[tokio::test]
async fn test_wrong_password_stays_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let mut vault = file_vault(&path);
    vault.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();
    add(&mut vault, "example.com").await;

    let mut reopened = file_vault(&path);
    let result = reopened.unlock(SecureBuffer::from("wrong password")).await;

    assert!(matches!(result, Err(SesamError::Credential)));
    assert!(!reopened.is_unlocked());
    assert!(matches!(reopened.domains(), Err(SesamError::VaultLocked)));
}

#[tokio::test]
async fn test_new_domain_uses_config_defaults() {
    let vault = memory_vault(PASSWORD).await;
    let ds = vault.new_domain("example.com").unwrap();

    assert_eq!(ds.iterations, vault.config().default_iterations);
    assert!(!ds.salt.is_empty());
    assert!(ds.password_template.starts_with("1;aAno"));
    assert_eq!(ds.password_template.len(), 2 + vault.config().default_password_length);
}

#[tokio::test]
async fn test_password_for_generated_and_legacy() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;

    let mut legacy = DomainSettings::new("old.net");
    legacy.legacy_password = "hunter2".to_string();
    vault.save_domain(legacy).await.unwrap();

    let generated = vault.password_for("example.com").unwrap();
    assert_eq!(generated.chars().count(), vault.config().default_password_length);
    assert_eq!(vault.password_for("example.com").unwrap(), generated);
    assert_eq!(vault.password_for("old.net").unwrap(), "hunter2");
    assert!(matches!(
        vault.password_for("missing.org"),
        Err(SesamError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_save_existing_domain_sets_modified_date() {
    let mut vault = memory_vault(PASSWORD).await;
    let ds = add(&mut vault, "example.com").await;
    assert!(vault.domains().unwrap().at("example.com").modified_date.is_none());

    vault.save_domain(ds).await.unwrap();
    assert!(vault.domains().unwrap().at("example.com").modified_date.is_some());
}

#[tokio::test]
async fn test_delete_leaves_tombstone() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;

    vault.delete_domain("example.com").await.unwrap();

    let ds = vault.domains().unwrap().at("example.com");
    assert!(ds.deleted);
    assert!(ds.salt.is_empty());
    assert!(ds.modified_date.is_some());
    assert!(vault.domains().unwrap().live_names().is_empty());
    assert!(matches!(
        vault.delete_domain("example.com").await,
        Err(SesamError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_save_deleted_record_strips_parameters() {
    let mut vault = memory_vault(PASSWORD).await;
    let mut ds = add(&mut vault, "example.com").await;
    ds.deleted = true;

    vault.save_domain(ds).await.unwrap();

    let stored = vault.domains().unwrap().at("example.com");
    assert!(stored.deleted);
    assert!(stored.user_name.is_empty());
}

#[tokio::test]
async fn test_empty_name_rejected() {
    let mut vault = memory_vault(PASSWORD).await;
    let result = vault.save_domain(DomainSettings::default()).await;

    assert!(matches!(result, Err(SesamError::InvalidInput(_))));
}

#[tokio::test]
async fn test_key_material_regenerated_after_save() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "a.com").await;
    let first = vault.settings.get(SYNC_DOMAINS).unwrap();
    add(&mut vault, "b.com").await;
    let second = vault.settings.get(SYNC_DOMAINS).unwrap();

    let (salt_a, _) = crypter::read_header(&STANDARD.decode(first).unwrap()).unwrap();
    let (salt_b, _) = crypter::read_header(&STANDARD.decode(second).unwrap()).unwrap();
    assert_ne!(salt_a, salt_b);
}

#[tokio::test]
async fn test_export_and_import_kgk() {
    let source = memory_vault(PASSWORD).await;
    let exported = source.export_kgk().unwrap();

    let decoded = crypter::decode(PASSWORD.as_bytes(), &exported, COMPRESSION_ENABLED).unwrap();
    assert_eq!(decoded.payload.as_bytes(), b"{}");

    let mut target = memory_vault("another password").await;
    add(&mut target, "example.com").await;
    let before = target.password_for("example.com").unwrap();

    target
        .import_kgk(exported, SecureBuffer::from(PASSWORD))
        .await
        .unwrap();

    assert!(target.kgk().unwrap().ct_eq(source.kgk().unwrap()));
    let frozen = target.domains().unwrap().at("example.com");
    assert!(frozen.is_legacy());
    assert!(frozen.modified_date.is_some());
    assert_eq!(target.password_for("example.com").unwrap(), before);
}

#[tokio::test]
async fn test_import_kgk_wrong_password() {
    let source = memory_vault(PASSWORD).await;
    let exported = source.export_kgk().unwrap();
    let mut target = memory_vault("another password").await;
    let kgk = target.kgk().unwrap().clone();

    let result = target
        .import_kgk(exported, SecureBuffer::from("not it"))
        .await;

    assert!(matches!(result, Err(SesamError::Credential)));
    assert!(target.kgk().unwrap().ct_eq(&kgk));
}

#[tokio::test]
async fn test_install_kgk_rejects_wrong_size() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    let kgk = vault.kgk().unwrap().clone();

    let result = vault.install_kgk(SecureBuffer::new(vec![7u8; 32])).await;

    assert!(matches!(
        result,
        Err(SesamError::InvalidKgk { expected: 64, got: 32 })
    ));
    assert!(vault.kgk().unwrap().ct_eq(&kgk));
    assert!(!vault.domains().unwrap().at("example.com").is_legacy());
}

#[tokio::test]
async fn test_change_master_password() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let mut vault = file_vault(&path);
    vault.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();
    add(&mut vault, "example.com").await;

    let wrong = vault
        .change_master_password(SecureBuffer::from("nope"), SecureBuffer::from("new"))
        .await;
    assert!(matches!(wrong, Err(SesamError::Credential)));

    vault
        .change_master_password(SecureBuffer::from(PASSWORD), SecureBuffer::from("new password"))
        .await
        .unwrap();
    vault.lock();

    let mut old = file_vault(&path);
    assert!(old.unlock(SecureBuffer::from(PASSWORD)).await.is_err());

    let mut reopened = file_vault(&path);
    reopened
        .unlock(SecureBuffer::from("new password"))
        .await
        .unwrap();
    assert!(reopened.domains().unwrap().contains("example.com"));
}

#[tokio::test]
async fn test_sync_config_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    let sync_config = SyncConfig {
        use_sync_file: true,
        sync_file: "/tmp/sesam.bin".to_string(),
        server_username: "alice".to_string(),
        ..Default::default()
    };

    let mut vault = file_vault(&path);
    vault.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();
    vault.save_sync_config(sync_config.clone()).await.unwrap();
    vault.lock();

    let mut reopened = file_vault(&path);
    reopened.unlock(SecureBuffer::from(PASSWORD)).await.unwrap();
    assert_eq!(reopened.sync_config(), &sync_config);
}

#[tokio::test]
async fn test_invalid_sync_config_rejected() {
    let mut vault = memory_vault(PASSWORD).await;
    let result = vault
        .save_sync_config(SyncConfig {
            use_sync_file: true,
            ..Default::default()
        })
        .await;

    assert!(matches!(result, Err(SesamError::Config(_))));
    assert!(!vault.sync_config().use_sync_file);
}

#[tokio::test]
async fn test_import_domains_renames_collisions() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;

    let renamed = vault
        .import_domains(vec![
            DomainSettings::new("EXAMPLE.com"),
            DomainSettings::new("fresh.org"),
        ])
        .await
        .unwrap();

    assert_eq!(
        renamed,
        vec![("EXAMPLE.com".to_string(), "EXAMPLE.com (1)".to_string())]
    );
    assert_eq!(vault.domains().unwrap().len(), 3);
    assert!(!vault.domains().unwrap().is_dirty());
}

#[tokio::test]
async fn test_clear_all() {
    let mut vault = memory_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    let old_kgk = vault.kgk().unwrap().clone();

    vault.clear_all().unwrap();

    assert!(!vault.is_unlocked());
    assert!(!vault.has_stored_data());
    assert!(vault.settings.keys().is_empty());

    vault.unlock(SecureBuffer::from("anything")).await.unwrap();
    assert!(vault.domains().unwrap().is_empty());
    assert!(!vault.kgk().unwrap().ct_eq(&old_kgk));
}

#[tokio::test]
async fn test_locked_vault_refuses_operations() {
    let mut vault = memory_vault(PASSWORD).await;
    vault.lock();

    assert!(matches!(vault.kgk(), Err(SesamError::VaultLocked)));
    assert!(matches!(vault.export_kgk(), Err(SesamError::VaultLocked)));
    assert!(matches!(
        vault.save_domain(DomainSettings::new("example.com")).await,
        Err(SesamError::VaultLocked)
    ));
}

#[tokio::test]
async fn test_failed_save_keeps_previous_state() {
    let (mut vault, failing) = unreliable_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    let stored = vault.settings.get(SYNC_DOMAINS);
    failing.store(true, Ordering::SeqCst);

    let mut ds = vault.new_domain("other.org").unwrap();
    ds.user_name = "carol".to_string();
    let result = vault.save_domain(ds).await;
    assert!(matches!(result, Err(SesamError::Io(_))));
    assert!(!vault.domains().unwrap().contains("other.org"));
    assert!(!vault.domains().unwrap().is_dirty());
    assert_eq!(vault.settings.get(SYNC_DOMAINS), stored);

    let result = vault
        .import_domains(vec![DomainSettings::new("imported.net")])
        .await;
    assert!(result.is_err());
    assert_eq!(vault.domains().unwrap().len(), 1);

    failing.store(false, Ordering::SeqCst);
    add(&mut vault, "other.org").await;
    assert_eq!(vault.domains().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_kgk_install_keeps_previous_kgk() {
    let (mut vault, failing) = unreliable_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    let kgk = vault.kgk().unwrap().clone();
    let password = vault.password_for("example.com").unwrap();
    failing.store(true, Ordering::SeqCst);

    let result = vault.install_kgk(SecureBuffer::random(KGK_SIZE)).await;

    assert!(result.is_err());
    assert!(vault.kgk().unwrap().ct_eq(&kgk));
    assert!(!vault.domains().unwrap().at("example.com").is_legacy());
    assert_eq!(vault.password_for("example.com").unwrap(), password);
    assert!(vault.settings.get(SYNC_PARAM).is_none());
}

#[tokio::test]
async fn test_failed_merge_commit_keeps_previous_state() {
    let (mut vault, failing) = unreliable_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    let kgk = vault.kgk().unwrap().clone();

    let mut merged = vault.domains().unwrap().clone();
    merged.upsert(DomainSettings::new("from-peer.org")).unwrap();
    failing.store(true, Ordering::SeqCst);

    let result = vault
        .commit_merge(merged, SecureBuffer::random(KGK_SIZE))
        .await;

    assert!(result.is_err());
    assert!(vault.kgk().unwrap().ct_eq(&kgk));
    assert!(!vault.domains().unwrap().contains("from-peer.org"));
}

#[tokio::test]
async fn test_failed_password_change_keeps_old_password() {
    let (mut vault, failing) = unreliable_vault(PASSWORD).await;
    add(&mut vault, "example.com").await;
    failing.store(true, Ordering::SeqCst);

    let result = vault
        .change_master_password(SecureBuffer::from(PASSWORD), SecureBuffer::from("new password"))
        .await;
    assert!(result.is_err());

    failing.store(false, Ordering::SeqCst);
    vault
        .change_master_password(SecureBuffer::from(PASSWORD), SecureBuffer::from("new password"))
        .await
        .unwrap();
}

//! Import/export of domain settings.
//!
//! - JSON: the full store, tombstones included, keyed by domain name
//! - Logins: clear-text INI-style list of live domains with their passwords

use crate::crypto::{PasswordGenerator, SecureBuffer};
use crate::domain::{DomainSettings, DomainSettingsList};
use crate::vault::Vault;
use crate::{Result, SesamError};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Pretty-printed JSON of the whole store.
pub fn export_json(domains: &DomainSettingsList) -> Result<String> {
    let by_name: BTreeMap<&str, &DomainSettings> = domains
        .iter()
        .map(|ds| (ds.domain_name.as_str(), ds))
        .collect();
    Ok(serde_json::to_string_pretty(&by_name)?)
}

/// Clear-text login list of every live domain.
///
/// ```text
/// [example.com]
/// pwd = ...
/// url = ...
/// user = ...
/// notes = ...
/// ```
pub fn export_logins(
    domains: &DomainSettingsList,
    kgk: &SecureBuffer,
    generator: &dyn PasswordGenerator,
) -> Result<String> {
    let mut out = String::new();
    for ds in domains.iter().filter(|ds| !ds.deleted) {
        let password = generator.generate(kgk, ds)?;
        writeln!(out, "[{}]", ds.domain_name)?;
        writeln!(out, "pwd = {}", password)?;
        writeln!(out, "url = {}", ds.url)?;
        writeln!(out, "user = {}", ds.user_name)?;
        writeln!(out, "notes = {}", escape_notes(&ds.notes))?;
        out.push('\n');
    }
    Ok(out)
}

/// Parse exported JSON: either an object keyed by domain name or an array
/// of records.
pub fn import_json(data: &[u8]) -> Result<Vec<DomainSettings>> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| SesamError::InvalidInput(format!("Import is not JSON: {}", e)))?;

    let records = match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(name, v)| {
                let mut ds: DomainSettings = serde_json::from_value(v)?;
                if ds.domain_name.is_empty() {
                    ds.domain_name = name;
                }
                Ok(ds)
            })
            .collect::<Result<Vec<_>>>()?,
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(SesamError::InvalidInput(
                "Import must be a JSON object or array".to_string(),
            ))
        }
    };

    Ok(records.into_iter().filter(|ds| !ds.is_empty()).collect())
}

/// Write the JSON export of an unlocked vault to `output`.
pub fn export_json_to_file(vault: &Vault, output: &Path) -> Result<()> {
    let json = export_json(vault.domains()?)?;
    std::fs::write(output, json)?;
    info!("Exported {} domains to {}", vault.domains()?.len(), output.display());
    Ok(())
}

/// Write the clear-text login list of an unlocked vault to `output`.
pub fn export_logins_to_file(vault: &Vault, output: &Path) -> Result<()> {
    let text = export_logins(vault.domains()?, vault.kgk()?, vault.generator().as_ref())?;
    std::fs::write(output, text)?;
    info!("Exported logins to {}", output.display());
    Ok(())
}

/// Read a JSON export and add its records to the vault.
///
/// Returns `(original, stored)` names of renamed records.
pub async fn import_json_file(vault: &mut Vault, input: &Path) -> Result<Vec<(String, String)>> {
    let data = std::fs::read(input)?;
    let records = import_json(&data)?;
    vault.import_domains(records).await
}

fn escape_notes(notes: &str) -> String {
    notes.replace('\\', "\\\\").replace('\n', "\\n")
}

//! The domain record store.
//!
//! Records are keyed by their case-folded domain name. Iteration order is
//! therefore case-insensitive lexicographic, which is also the listing order.

use crate::domain::DomainSettings;
use crate::{Result, SesamError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Case-insensitive mapping from domain name to its settings.
#[derive(Debug, Clone, Default)]
pub struct DomainSettingsList {
    entries: BTreeMap<String, DomainSettings>,
    dirty: bool,
}

impl DomainSettingsList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record. A miss yields the empty sentinel record.
    pub fn at(&self, name: &str) -> DomainSettings {
        self.get(name).cloned().unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&DomainSettings> {
        self.entries.get(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Insert or replace a record as edited by the user.
    ///
    /// An existing record gets `modified_date = now`. A new one gets
    /// `created_date = now` and no modification date.
    pub fn upsert(&mut self, record: DomainSettings) -> Result<()> {
        self.upsert_at(record, Utc::now())
    }

    /// [`upsert`](Self::upsert) with an explicit clock.
    pub fn upsert_at(&mut self, mut record: DomainSettings, now: DateTime<Utc>) -> Result<()> {
        if record.is_empty() {
            return Err(SesamError::InvalidInput("Domain name must not be empty".to_string()));
        }
        if self.contains(&record.domain_name) {
            record.modified_date = Some(now);
        } else {
            record.created_date = Some(now);
            record.modified_date = None;
        }
        self.update_with(record);
        Ok(())
    }

    /// Insert or replace a record verbatim, timestamps untouched.
    ///
    /// Used when adopting a record from a peer.
    pub fn update_with(&mut self, record: DomainSettings) {
        self.entries.insert(record.key(), record);
        self.dirty = true;
    }

    pub fn remove(&mut self, name: &str) -> Option<DomainSettings> {
        let removed = self.entries.remove(&name.to_lowercase());
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Every stored domain name, tombstones included, in listing order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.values().map(|ds| ds.domain_name.clone()).collect()
    }

    /// Names of records that are not tombstones.
    pub fn live_names(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|ds| !ds.deleted)
            .map(|ds| ds.domain_name.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainSettings> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Serialize as a JSON object keyed by domain name.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let by_name: BTreeMap<&str, &DomainSettings> = self
            .entries
            .values()
            .map(|ds| (ds.domain_name.as_str(), ds))
            .collect();
        Ok(serde_json::to_vec(&by_name)?)
    }

    /// Parse a JSON object keyed by domain name. The result is not dirty.
    ///
    /// Names that differ only in case collide; the most recently modified
    /// record is kept.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let by_name: BTreeMap<String, DomainSettings> = serde_json::from_slice(data)
            .map_err(|e| SesamError::MalformedPayload(format!("Domain list: {}", e)))?;

        let mut list = Self::new();
        for (name, mut ds) in by_name {
            if ds.domain_name.is_empty() {
                ds.domain_name = name;
            }
            if ds.is_empty() {
                continue;
            }
            if let Some(existing) = list.entries.get(&ds.key()) {
                warn!(
                    "Domain list holds both {} and {}, keeping the newer one",
                    existing.domain_name, ds.domain_name
                );
                if ds.modified_date <= existing.modified_date {
                    continue;
                }
            }
            list.entries.insert(ds.key(), ds);
        }
        Ok(list)
    }

    /// Append records, renaming any whose name is held by a live record.
    ///
    /// A tombstone is replaced. The imported record is stamped as modified
    /// so it wins over the tombstone on every peer.
    ///
    /// Returns `(original, stored)` for every record that was renamed.
    pub fn import(&mut self, records: impl IntoIterator<Item = DomainSettings>) -> Vec<(String, String)> {
        let mut renamed = Vec::new();
        for mut ds in records {
            if ds.is_empty() {
                continue;
            }
            let existing_deleted = self.get(&ds.domain_name).map(|existing| existing.deleted);
            if existing_deleted == Some(true) {
                ds.modified_date = Some(Utc::now());
            } else if existing_deleted.is_some() {
                let taken = self.key_set();
                let alternative = alternative_domain_name(&ds.domain_name, &taken);
                renamed.push((ds.domain_name.clone(), alternative.clone()));
                ds.domain_name = alternative;
            }
            self.update_with(ds);
        }
        renamed
    }

    /// Case-folded names, for collision checks.
    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }
}

/// First free `"name (n)"` for n = 1, 2, ... given the case-folded names
/// in `taken`.
pub fn alternative_domain_name(name: &str, taken: &BTreeSet<String>) -> String {
    let mut n = 1u32;
    loop {
        let candidate = format!("{} ({})", name, n);
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

impl FromIterator<DomainSettings> for DomainSettingsList {
    fn from_iter<I: IntoIterator<Item = DomainSettings>>(iter: I) -> Self {
        let mut list = Self::new();
        for ds in iter {
            list.update_with(ds);
        }
        list.dirty = false;
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_at_miss_returns_empty() {
        let list = DomainSettingsList::new();
        assert!(list.at("nowhere.com").is_empty());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut list = DomainSettingsList::new();
        list.update_with(DomainSettings::new("GitHub.com"));

        assert_eq!(list.at("github.COM").domain_name, "GitHub.com");
        assert!(list.contains("GITHUB.com"));
    }

    #[test]
    fn test_upsert_new_sets_created_clears_modified() {
        let mut list = DomainSettingsList::new();
        let mut ds = DomainSettings::new("example.com");
        ds.modified_date = Some(t0());

        list.upsert_at(ds, t0() + Duration::hours(1)).unwrap();

        let stored = list.at("example.com");
        assert_eq!(stored.created_date, Some(t0() + Duration::hours(1)));
        assert!(stored.modified_date.is_none());
        assert!(list.is_dirty());
    }

    #[test]
    fn test_upsert_existing_sets_modified() {
        let mut list = DomainSettingsList::new();
        list.upsert_at(DomainSettings::new("example.com"), t0()).unwrap();
        let mut edited = list.at("example.com");
        edited.user_name = "carol".to_string();

        list.upsert_at(edited, t0() + Duration::days(1)).unwrap();

        let stored = list.at("Example.com");
        assert_eq!(stored.user_name, "carol");
        assert_eq!(stored.created_date, Some(t0()));
        assert_eq!(stored.modified_date, Some(t0() + Duration::days(1)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_upsert_rejects_empty_name() {
        let mut list = DomainSettingsList::new();
        assert!(list.upsert(DomainSettings::default()).is_err());
    }

    #[test]
    fn test_remove_sets_dirty() {
        let mut list: DomainSettingsList = vec![DomainSettings::new("a.com")].into_iter().collect();
        assert!(!list.is_dirty());

        assert!(list.remove("nothing").is_none());
        assert!(!list.is_dirty());

        assert!(list.remove("A.COM").is_some());
        assert!(list.is_dirty());
        assert!(list.is_empty());
    }

    #[test]
    fn test_keys_sorted_case_insensitively() {
        let list: DomainSettingsList = ["beta.org", "Alpha.com", "gamma.net"]
            .into_iter()
            .map(DomainSettings::new)
            .collect();

        assert_eq!(list.keys(), vec!["Alpha.com", "beta.org", "gamma.net"]);
    }

    #[test]
    fn test_live_names_skip_tombstones() {
        let mut gone = DomainSettings::new("gone.com");
        gone.deleted = true;
        let list: DomainSettingsList = vec![DomainSettings::new("here.com"), gone].into_iter().collect();

        assert_eq!(list.live_names(), vec!["here.com"]);
        assert_eq!(list.keys().len(), 2);
    }

    #[test]
    fn test_json_document_keyed_by_name() {
        let mut ds = DomainSettings::new("Example.com");
        ds.iterations = 4096;
        let list: DomainSettingsList = vec![ds].into_iter().collect();

        let json = list.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["Example.com"]["domain"], "Example.com");

        let restored = DomainSettingsList::from_json(&json).unwrap();
        assert_eq!(restored.at("example.com").iterations, 4096);
        assert!(!restored.is_dirty());
    }

    #[test]
    fn test_from_json_empty_object() {
        let list = DomainSettingsList::from_json(b"{}").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = DomainSettingsList::from_json(b"not json").unwrap_err();
        assert!(matches!(err, SesamError::MalformedPayload(_)));
    }

    #[test]
    fn test_import_renames_collisions() {
        let mut list = DomainSettingsList::new();
        let mut first = DomainSettings::new("mail.com");
        first.user_name = "one".to_string();
        let mut second = DomainSettings::new("mail.com");
        second.user_name = "two".to_string();

        let renamed = list.import(vec![first, second]);

        assert_eq!(list.keys(), vec!["mail.com", "mail.com (1)"]);
        assert_eq!(list.at("mail.com (1)").user_name, "two");
        assert_eq!(renamed, vec![("mail.com".to_string(), "mail.com (1)".to_string())]);
    }

    #[test]
    fn test_import_replaces_tombstone() {
        let mut gone = DomainSettings::new("mail.com");
        gone.deleted = true;
        gone.modified_date = Some(t0());
        let mut list: DomainSettingsList = vec![gone].into_iter().collect();
        let mut imported = DomainSettings::new("Mail.com");
        imported.user_name = "back".to_string();

        let renamed = list.import(vec![imported]);

        assert!(renamed.is_empty());
        assert_eq!(list.keys(), vec!["Mail.com"]);
        let stored = list.at("mail.com");
        assert!(!stored.deleted);
        assert_eq!(stored.user_name, "back");
        assert!(stored.modified_date > Some(t0()));
    }

    #[test]
    fn test_from_json_case_collision_keeps_newer() {
        let json = br#"{
            "Mail.com": {"domain": "Mail.com", "username": "newer", "mDate": "2016-03-01T00:00:00Z"},
            "mail.com": {"domain": "mail.com", "username": "older", "mDate": "2016-01-01T00:00:00Z"}
        }"#;

        let list = DomainSettingsList::from_json(json).unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list.at("MAIL.COM").user_name, "newer");
        assert!(!list.is_dirty());
    }

    #[test]
    fn test_alternative_name_picks_smallest_free() {
        let taken: BTreeSet<String> = ["mail.com", "mail.com (1)", "mail.com (3)"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(alternative_domain_name("mail.com", &taken), "mail.com (2)");
        assert_eq!(alternative_domain_name("Other", &taken), "Other (1)");
    }
}

//! A single domain's credential parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters from which one domain's password is (re)generated.
///
/// Identity is the domain name compared case-insensitively; two records
/// with the same name are equal regardless of their other fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainSettings {
    #[serde(rename = "domain")]
    pub domain_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(rename = "username", default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,

    /// Literal password used instead of generation when non-empty
    #[serde(rename = "legacyPassword", default, skip_serializing_if = "String::is_empty")]
    pub legacy_password: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    #[serde(default)]
    pub iterations: u32,

    /// Base64 encoded generation salt
    #[serde(default)]
    pub salt: String,

    #[serde(rename = "cDate", default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,

    /// Last-writer-wins clock for sync
    #[serde(rename = "mDate", default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<DateTime<Utc>>,

    #[serde(rename = "extras", default, skip_serializing_if = "String::is_empty")]
    pub extra_characters: String,

    #[serde(rename = "usedCharacters", default, skip_serializing_if = "String::is_empty")]
    pub used_characters: String,

    #[serde(rename = "passwordTemplate", default, skip_serializing_if = "String::is_empty")]
    pub password_template: String,

    /// Tombstone: hidden from listings but still synchronized
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Attachment name to base64 blob. Carried through sync untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

impl DomainSettings {
    /// Create a record for `domain_name` with every other field empty.
    pub fn new(domain_name: impl Into<String>) -> Self {
        Self {
            domain_name: domain_name.into(),
            ..Default::default()
        }
    }

    /// The sentinel returned for lookups that miss.
    pub fn is_empty(&self) -> bool {
        self.domain_name.is_empty()
    }

    pub fn is_legacy(&self) -> bool {
        !self.legacy_password.is_empty()
    }

    /// Case-folded name used as the store key.
    pub fn key(&self) -> String {
        self.domain_name.to_lowercase()
    }

    /// Mark the record deleted. Parameters are dropped; the name and
    /// timestamps survive so the deletion can propagate.
    pub fn into_tombstone(self) -> Self {
        Self {
            domain_name: self.domain_name,
            created_date: self.created_date,
            modified_date: self.modified_date,
            deleted: true,
            ..Default::default()
        }
    }
}

impl PartialEq for DomainSettings {
    fn eq(&self, other: &Self) -> bool {
        self.domain_name.to_lowercase() == other.domain_name.to_lowercase()
    }
}

impl Eq for DomainSettings {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_equality_is_case_insensitive_name() {
        let mut a = DomainSettings::new("Example.com");
        a.user_name = "alice".to_string();
        let b = DomainSettings::new("example.COM");

        assert_eq!(a, b);
        assert_ne!(a, DomainSettings::new("example.org"));
    }

    #[test]
    fn test_empty_sentinel() {
        assert!(DomainSettings::default().is_empty());
        assert!(!DomainSettings::new("a").is_empty());
    }

    #[test]
    fn test_json_field_names() {
        let mut ds = DomainSettings::new("example.com");
        ds.user_name = "bob".to_string();
        ds.legacy_password = "s3cret".to_string();
        ds.iterations = 4096;
        ds.salt = "c2FsdA==".to_string();
        ds.modified_date = Some(Utc.with_ymd_and_hms(2016, 3, 1, 12, 0, 0).unwrap());

        let value = serde_json::to_value(&ds).unwrap();
        assert_eq!(value["domain"], "example.com");
        assert_eq!(value["username"], "bob");
        assert_eq!(value["legacyPassword"], "s3cret");
        assert_eq!(value["iterations"], 4096);
        assert!(value["mDate"].as_str().unwrap().starts_with("2016-03-01T12:00:00"));
        assert!(value.get("deleted").is_none());
        assert!(value.get("cDate").is_none());
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let ds: DomainSettings = serde_json::from_str(r#"{"domain":"x.org","deleted":true}"#).unwrap();
        assert_eq!(ds.domain_name, "x.org");
        assert!(ds.deleted);
        assert_eq!(ds.iterations, 0);
        assert!(ds.modified_date.is_none());
    }

    #[test]
    fn test_into_tombstone_keeps_identity() {
        let mut ds = DomainSettings::new("bank.example");
        ds.legacy_password = "pw".to_string();
        ds.notes = "pin 1234".to_string();
        let created = Some(Utc::now());
        ds.created_date = created;

        let tomb = ds.into_tombstone();
        assert!(tomb.deleted);
        assert_eq!(tomb.domain_name, "bank.example");
        assert_eq!(tomb.created_date, created);
        assert!(tomb.notes.is_empty());
        assert!(!tomb.is_legacy());
    }
}

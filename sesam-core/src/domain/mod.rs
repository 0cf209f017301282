//! Domain credential parameters and their store.

pub mod list;
pub mod settings;

pub use list::{alternative_domain_name, DomainSettingsList};
pub use settings::DomainSettings;

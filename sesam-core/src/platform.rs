//! Default locations for settings, configuration and the sync file.

use std::path::PathBuf;

const APP_DIR: &str = "sesam";

/// Directory for persisted settings and the default sync file
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\sesam
/// - macOS: ~/Library/Application Support/sesam
/// - Linux/Other: ~/.local/share/sesam
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Directory for `sesam.toml`
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Default JSON settings file holding the encrypted `sync/*` entries
pub fn get_default_settings_path() -> PathBuf {
    get_data_dir().join("settings.json")
}

/// Default application configuration file
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("sesam.toml")
}

/// Default sync file, used until the user configures another one
pub fn get_default_sync_file_path() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(get_data_dir)
        .join("sesam-sync.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_end_with_app_dir() {
        assert!(get_data_dir().ends_with(APP_DIR));
        assert!(get_config_dir().ends_with(APP_DIR));
    }

    #[test]
    fn test_default_paths() {
        assert!(get_default_settings_path().ends_with("sesam/settings.json"));
        assert!(get_default_config_path().ends_with("sesam/sesam.toml"));
        assert_eq!(
            get_default_sync_file_path().file_name().and_then(|n| n.to_str()),
            Some("sesam-sync.bin")
        );
    }
}

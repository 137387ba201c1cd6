//! Configuration directory discovery

use std::path::PathBuf;

const APP_DIR: &str = "ftpd-rs";

/// The platform configuration directory for this server
///
/// `XDG_CONFIG_HOME` and `APPDATA` take precedence, then the platform
/// default, then `HOME/.config`.
pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    if let Some(appdata) = std::env::var_os("APPDATA").filter(|v| !v.is_empty()) {
        return PathBuf::from(appdata).join(APP_DIR);
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join(APP_DIR);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".config").join(APP_DIR);
    }
    PathBuf::from(".").join(APP_DIR)
}

/// File names of the persisted documents
pub mod files {
    /// Listeners, server settings, administration settings
    pub const SETTINGS: &str = "settings.xml";
    /// User accounts
    pub const USERS: &str = "users.xml";
    /// Groups
    pub const GROUPS: &str = "groups.xml";
    /// Extra certificate info sidecar
    pub const CERT_EXTRA: &str = "certificates.xml";
}

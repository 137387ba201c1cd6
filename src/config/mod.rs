//! Configuration: model, XML persistence, path discovery, snapshots
//!
//! The administration server owns the authoritative [`Config`] inside a
//! [`ConfigStore`]; the FTP listeners and the authenticator read immutable
//! snapshots. Saving writes each document to a temp file and renames it
//! into place, so a crash can never leave a half-written document.

pub mod model;
pub mod paths;
pub mod xml;

pub use model::{
    hosts_conflict, AdminSettings, AutobanConfig, Config, ConfigStore, ListenerConfig,
    ServerSettings, TlsMode,
};
pub use paths::config_dir;

use crate::error::{FtpdError, Result};
use std::path::Path;
use tracing::{debug, info};

/// Load every configuration document from `dir`
///
/// Missing documents fall back to defaults; a present-but-broken document
/// is an error so a typo cannot silently wipe accounts.
pub async fn load_all(dir: &Path) -> Result<Config> {
    let mut config = Config::default();

    if let Some(text) = read_optional(&dir.join(paths::files::SETTINGS)).await? {
        let (listeners, settings, admin) = xml::settings_from_xml(&text)?;
        config.listeners = listeners;
        config.settings = settings;
        config.admin = admin;
    }
    if let Some(text) = read_optional(&dir.join(paths::files::USERS)).await? {
        config.users = xml::users_from_xml(&text)?;
    }
    if let Some(text) = read_optional(&dir.join(paths::files::GROUPS)).await? {
        config.groups = xml::groups_from_xml(&text)?;
    }

    config.validate()?;
    debug!(dir = %dir.display(), "configuration loaded");
    Ok(config)
}

/// Persist every configuration document into `dir`
pub async fn save_all(dir: &Path, config: &Config) -> Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(dir).await?;

    let settings = xml::settings_to_xml(&config.listeners, &config.settings, &config.admin)?;
    let users = xml::users_to_xml(&config.users)?;
    let groups = xml::groups_to_xml(&config.groups)?;

    write_atomic(&dir.join(paths::files::SETTINGS), &settings).await?;
    write_atomic(&dir.join(paths::files::USERS), &users).await?;
    write_atomic(&dir.join(paths::files::GROUPS), &groups).await?;

    info!(dir = %dir.display(), "configuration saved");
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FtpdError::Config(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FtpdError::Config(format!("bad config path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}",
        uuid::Uuid::new_v4().simple()
    ));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.listeners = vec![ListenerConfig {
            address: "127.0.0.1".parse().expect("addr"),
            port: 2121,
            tls: TlsMode::Plain,
        }];
        config.users = vec![User::new("alice")];
        config.settings.banner = "hello\nworld".to_owned();

        save_all(dir.path(), &config).await.expect("save");
        let loaded = load_all(dir.path()).await.expect("load");

        assert_eq!(loaded.listeners, config.listeners);
        assert_eq!(loaded.users, config.users);
        assert_eq!(loaded.settings, config.settings);
        assert_eq!(loaded.admin, config.admin);
    }

    #[tokio::test]
    async fn test_missing_dir_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_all(&dir.path().join("nope")).await.expect("defaults");
        assert!(loaded.users.is_empty());
        assert_eq!(loaded.admin.port, 14148);
    }

    #[tokio::test]
    async fn test_no_stray_temp_files_after_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        save_all(dir.path(), &Config::default()).await.expect("save");
        let strays = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(strays, 0);
    }
}

//! Persistence Interfaces (§4.5): a Secret Store for passwords and a
//! Key-Value Store for settings, reached only through their traits so
//! tests can substitute in-memory fakes (§9's "collaborators reached
//! through an interface" design note) instead of touching a filesystem.
//!
//! Default file-backed implementations are provided since spec.md
//! describes these as "platform-provided" but a runnable crate needs
//! one. Grounded in the teacher's `agent/memory.rs` file-I/O idiom
//! (`fs::create_dir_all`, `anyhow::Result`), reusing the Chat Log
//! Store's path sanitization (§4.6) rather than inventing a second
//! scheme, and resolving the data root via `directories::ProjectDirs`
//! with the `XMPBEE_HOME` override spec.md §6 permits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::logstore::sanitize_path_component;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, account_key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    async fn get(&self, account_key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, account_key: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<SettingsBlob>;
    async fn save(&self, blob: &SettingsBlob) -> anyhow::Result<()>;
}

fn default_true() -> bool {
    true
}

/// The single blob §3/§4.5 describe: last-used account parameters,
/// saved room names and DM nicknames per account, notification prefs.
/// Plaintext passwords must never appear here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsBlob {
    pub last_account_jid: Option<String>,
    #[serde(default)]
    pub saved_rooms: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub saved_dm_nicknames: HashMap<String, Vec<String>>,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub sounds_enabled: bool,
}

/// Resolves the app-data root: `XMPBEE_HOME` if set, else the platform
/// data directory.
pub fn data_root() -> PathBuf {
    if let Ok(home) = std::env::var("XMPBEE_HOME") {
        return PathBuf::from(home);
    }
    directories::ProjectDirs::from("org", "process-one", "xmpbee")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./xmpbee-data"))
}

/// One file per bare JID under `<data_root>/secrets/<sanitized-jid>`,
/// owner-only permissions on Unix.
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(data_root: &Path) -> Self {
        FileSecretStore { root: data_root.join("secrets") }
    }

    fn path_for(&self, account_key: &str) -> PathBuf {
        self.root.join(sanitize_path_component(account_key))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn put(&self, account_key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(account_key);
        tokio::fs::write(&path, bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        debug!("secret stored for {account_key}");
        Ok(())
    }

    async fn get(&self, account_key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(account_key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, account_key: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.path_for(account_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Single JSON blob at `<data_root>/settings.json`.
pub struct FileKeyValueStore {
    path: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(data_root: &Path) -> Self {
        FileKeyValueStore { path: data_root.join("settings.json") }
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn load(&self) -> anyhow::Result<SettingsBlob> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SettingsBlob::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, blob: &SettingsBlob) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(blob)?).await?;
        info!("settings saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn secret_store_round_trips_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(tmp.path());
        assert!(store.get("alice@example.org").await.unwrap().is_none());

        store.put("alice@example.org", b"hunter2").await.unwrap();
        assert_eq!(store.get("alice@example.org").await.unwrap().unwrap(), b"hunter2");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = tokio::fs::metadata(store.path_for("alice@example.org")).await.unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }

        store.delete("alice@example.org").await.unwrap();
        assert!(store.get("alice@example.org").await.unwrap().is_none());
        // deleting an already-absent secret is not an error
        store.delete("alice@example.org").await.unwrap();
    }

    #[tokio::test]
    async fn key_value_store_round_trips_and_defaults_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(tmp.path());

        let loaded = store.load().await.unwrap();
        assert!(loaded.notifications_enabled);
        assert!(loaded.last_account_jid.is_none());

        let mut blob = loaded;
        blob.last_account_jid = Some("alice@example.org".into());
        blob.saved_rooms.insert("alice@example.org".into(), vec!["lobby@muc.example.org".into()]);
        store.save(&blob).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.last_account_jid.as_deref(), Some("alice@example.org"));
        assert_eq!(reloaded.saved_rooms["alice@example.org"], vec!["lobby@muc.example.org"]);
    }

    #[test]
    fn data_root_honors_xmpbee_home_override() {
        std::env::set_var("XMPBEE_HOME", "/tmp/xmpbee-test-home");
        assert_eq!(data_root(), PathBuf::from("/tmp/xmpbee-test-home"));
        std::env::remove_var("XMPBEE_HOME");
    }
}

//! Local profile persistence: display name and broker configuration.
//!
//! A single JSON file under the platform config directory. Load never
//! fails: a missing or unreadable file yields defaults, and the problem is
//! logged rather than surfaced.

use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use sparkchat_shared::types::ServerConfig;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("No home directory available")]
    NoHome,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub display_name: String,
    pub server: ServerConfig,
}

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Store under the platform config directory.
    pub fn open_default() -> Result<Self, ProfileError> {
        let dirs = ProjectDirs::from("", "", "sparkchat").ok_or(ProfileError::NoHome)?;
        let dir = dirs.config_dir();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("profile.json"),
        })
    }

    /// Store at an explicit path (tests, portable installs).
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the profile, falling back to defaults on any problem.
    pub fn load(&self) -> Profile {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Corrupt profile file, using defaults");
                    Profile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Profile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read profile, using defaults");
                Profile::default()
            }
        }
    }

    pub fn save_display_name(&self, name: &str) -> Result<(), ProfileError> {
        let mut profile = self.load();
        profile.display_name = name.trim().to_string();
        self.write(&profile)
    }

    pub fn save_server_config(&self, config: &ServerConfig) -> Result<(), ProfileError> {
        let mut profile = self.load();
        profile.server = config.clone();
        self.write(&profile)
    }

    fn write(&self, profile: &Profile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(profile)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::with_path(dir.path().join("profile.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let (_dir, store) = temp_store();
        let profile = store.load();
        assert_eq!(profile, Profile::default());
        assert_eq!(profile.server.topic_prefix, "spark-chat-room");
    }

    #[test]
    fn test_save_and_reload() {
        let (_dir, store) = temp_store();

        store.save_display_name("  alice  ").unwrap();
        assert_eq!(store.load().display_name, "alice");

        let config = ServerConfig {
            broker_url: "wss://broker.example".to_string(),
            port: 9001,
            topic_prefix: "my-room".to_string(),
        };
        store.save_server_config(&config).unwrap();

        let profile = store.load();
        assert_eq!(profile.display_name, "alice");
        assert_eq!(profile.server, config);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let (_dir, store) = temp_store();
        fs::write(store.path.clone(), b"{not json").unwrap();
        assert_eq!(store.load(), Profile::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let (_dir, store) = temp_store();
        fs::write(store.path.clone(), br#"{"displayName":"bob"}"#).unwrap();
        let profile = store.load();
        assert_eq!(profile.display_name, "bob");
        assert_eq!(profile.server, ServerConfig::default());
    }
}

//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend location and endpoint paths, timeouts for ordinary requests and
//! for token refresh, and where credentials are kept.
//!
//! Configuration is stored at `~/.config/chipin/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/data directory paths
const APP_NAME: &str = "chipin";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Delay before the first refresh retry after a network failure.
/// Doubles on each further attempt.
pub const REFRESH_INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    /// OS keychain
    #[default]
    Keyring,
    /// JSON file in the data directory
    File,
}

impl std::str::FromStr for CredentialBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" | "keychain" => Ok(CredentialBackend::Keyring),
            "file" => Ok(CredentialBackend::File),
            other => Err(format!("unknown credential backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Credential endpoint: `{username, password}` -> `{access, refresh}`
    pub token_path: String,
    /// Refresh endpoint: `{refresh}` -> `{access}`
    pub refresh_path: String,
    pub register_path: String,
    pub request_timeout_secs: u64,
    /// Upper bound on a whole refresh cycle, retries included.
    pub refresh_timeout_secs: u64,
    /// Extra refresh attempts after a network failure.
    pub refresh_network_retries: u32,
    /// Treat 403 like 401 (for backends that answer expired tokens with 403).
    pub forbidden_is_unauthorized: bool,
    pub credential_backend: CredentialBackend,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            token_path: "/token/".to_string(),
            refresh_path: "/token/refresh/".to_string(),
            register_path: "/register/".to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 15,
            refresh_network_retries: 1,
            forbidden_is_unauthorized: false,
            credential_backend: CredentialBackend::Keyring,
            last_username: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override settings from `CHIPIN_API_URL` and `CHIPIN_CREDENTIAL_BACKEND`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("CHIPIN_API_URL") {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(backend) = std::env::var("CHIPIN_CREDENTIAL_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.credential_backend = backend,
                Err(e) => warn!(error = %e, "Ignoring CHIPIN_CREDENTIAL_BACKEND"),
            }
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the credential file and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.token_path, "/token/");
        assert_eq!(config.refresh_path, "/token/refresh/");
        assert_eq!(config.refresh_timeout(), Duration::from_secs(15));
        assert_eq!(config.credential_backend, CredentialBackend::Keyring);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"api_base_url": "https://chipin.example/api/v1", "credential_backend": "file"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_base_url, "https://chipin.example/api/v1");
        assert_eq!(config.credential_backend, CredentialBackend::File);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.refresh_network_retries, 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config {
            last_username: Some("ann".to_string()),
            forbidden_is_unauthorized: true,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.last_username.as_deref(), Some("ann"));
        assert!(reloaded.forbidden_is_unauthorized);
    }

    #[test]
    fn test_credential_backend_parsing() {
        assert_eq!("FILE".parse::<CredentialBackend>(), Ok(CredentialBackend::File));
        assert_eq!("keychain".parse::<CredentialBackend>(), Ok(CredentialBackend::Keyring));
        assert!("vault".parse::<CredentialBackend>().is_err());
    }
}

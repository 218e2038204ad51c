//! CLI settings
//!
//! Stored in ~/.pipetun/config.json and overridden by `PIPETUN_*`
//! environment variables.

use anyhow::{Context, Result};
use pipetun_proto::Endpoint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_ENV: &str = "PIPETUN_API";
pub const TOKEN_ENV: &str = "PIPETUN_TOKEN";
pub const USER_ENV: &str = "PIPETUN_USER";
pub const PROXY_ENV: &str = "PIPETUN_PROXY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Platform REST API, e.g. https://platform.example.com/restapi
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    /// Platform user name presented to the edge proxy
    pub user: Option<String>,
    /// Edge proxy override (host:port)
    pub proxy: Option<String>,
    pub listen_host: String,
    pub connect_timeout_secs: u64,
    pub retries: usize,
    pub restart_backoff_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: None,
            access_token: None,
            user: None,
            proxy: None,
            listen_host: "127.0.0.1".to_string(),
            connect_timeout_secs: 10,
            retries: 10,
            restart_backoff_secs: 10,
        }
    }
}

impl Settings {
    /// Apply overrides from a variable lookup
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(api) = non_empty(API_ENV) {
            self.api_url = Some(api);
        }
        if let Some(token) = non_empty(TOKEN_ENV) {
            self.access_token = Some(token);
        }
        if let Some(user) = non_empty(USER_ENV) {
            self.user = Some(user);
        }
        if let Some(proxy) = non_empty(PROXY_ENV) {
            self.proxy = Some(proxy);
        }
        self
    }

    pub fn with_process_env(self) -> Self {
        self.apply_env(|name| std::env::var(name).ok())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub fn proxy_override(&self) -> Result<Option<Endpoint>> {
        self.proxy
            .as_deref()
            .map(|proxy| {
                proxy
                    .parse::<Endpoint>()
                    .with_context(|| format!("Invalid proxy setting: {}", proxy))
            })
            .transpose()
    }
}

/// Base directory for settings, logs and generated keys
pub fn pipetun_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".pipetun"))
}

/// Reads and writes the settings file
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// ~/.pipetun/config.json
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(pipetun_home()?.join("config.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings, falling back to defaults when the file is missing
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;
        let settings = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(settings).context("Failed to serialize config")?;
        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;
        Ok(())
    }

    pub fn set_api(&self, url: String) -> Result<()> {
        let mut settings = self.load()?;
        settings.api_url = Some(url.trim_end_matches('/').to_string());
        self.save(&settings)
    }

    pub fn set_token(&self, token: String) -> Result<()> {
        let mut settings = self.load()?;
        settings.access_token = Some(token);
        self.save(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.listen_host, "127.0.0.1");
        assert_eq!(settings.retries, 10);
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert!(settings.proxy_override().unwrap().is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("config.json"));
        assert_eq!(manager.load().unwrap(), Settings::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("config.json"));
        fs::write(manager.path(), r#"{"api_url": "https://api", "retries": 3}"#).unwrap();

        let settings = manager.load().unwrap();
        assert_eq!(settings.api_url.as_deref(), Some("https://api"));
        assert_eq!(settings.retries, 3);
        assert_eq!(settings.restart_backoff_secs, 10);
    }

    #[test]
    fn test_set_api_and_token() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("nested").join("config.json"));
        manager.set_api("https://platform/restapi/".to_string()).unwrap();
        manager.set_token("secret".to_string()).unwrap();

        let settings = manager.load().unwrap();
        assert_eq!(settings.api_url.as_deref(), Some("https://platform/restapi"));
        assert_eq!(settings.access_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (API_ENV, "https://env/restapi"),
            (PROXY_ENV, "edge.example.com:8080"),
            (USER_ENV, ""),
        ]
        .into_iter()
        .collect();

        let settings = Settings {
            user: Some("alice".to_string()),
            ..Settings::default()
        }
        .apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.api_url.as_deref(), Some("https://env/restapi"));
        assert_eq!(settings.user.as_deref(), Some("alice"));
        assert_eq!(
            settings.proxy_override().unwrap(),
            Some(Endpoint::new("edge.example.com", 8080))
        );
    }
}

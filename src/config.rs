use crate::services::source::Credentials;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "novolume.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub novels: Vec<String>,
    pub download_root: PathBuf,
    pub max_workers: usize,
    pub request_timeout_secs: u64,
    pub text_timeout_secs: u64,
    pub min_text_bytes: usize,
    /// Random pause between illustration pages, `[min, max]` in milliseconds.
    pub page_delay_ms: [u64; 2],
    pub language: String,
    pub base_url: String,
    pub download_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            novels: Vec::new(),
            download_root: PathBuf::from("download"),
            max_workers: 10,
            request_timeout_secs: 30,
            text_timeout_secs: 60,
            min_text_bytes: 100,
            page_delay_ms: [1500, 3500],
            language: "zh".to_string(),
            base_url: "https://www.wenku8.net".to_string(),
            download_base_url: "https://dl.wenku8.com".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Loads `explicit` if given; otherwise the default file when it exists, else defaults.
    /// Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                tracing::info!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                Self::default()
            }
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(username) = lookup("NOVOLUME_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("NOVOLUME_PASSWORD") {
            self.password = password;
        }
        self
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn text_timeout(&self) -> Duration {
        Duration::from_secs(self.text_timeout_secs)
    }

    pub fn page_delay(&self) -> (u64, u64) {
        let [a, b] = self.page_delay_ms;
        (a.min(b), a.max(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"username": "reader", "novels": ["书一", "书二"], "page_delay_ms": [900, 100]}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.username, "reader");
        assert_eq!(config.novels, vec!["书一", "书二"]);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.min_text_bytes, 100);
        assert_eq!(config.download_root, PathBuf::from("download"));
        assert_eq!(config.page_delay(), (100, 900));
    }

    #[test]
    fn environment_overrides_credentials() {
        let config = Config::default().with_overrides(|key| match key {
            "NOVOLUME_PASSWORD" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(config.password, "secret");
        assert_eq!(config.username, "");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"max_workers": "many"}"#).unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}

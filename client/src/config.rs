use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::debug;
use url::Url;

pub const ENV_API_BASE_URL: &str = "TAPFARM_API_BASE_URL";
pub const ENV_AUTH_BASE_URL: &str = "TAPFARM_AUTH_BASE_URL";
pub const ENV_BOT_TOKEN: &str = "TAPFARM_BOT_TOKEN";
pub const ENV_LOG_LEVEL: &str = "TAPFARM_LOG_LEVEL";

/// Client configuration (from config file, then environment).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub auth_base_url: String,
    pub bot_username: String,
    /// Only needed when `verify_init_data` is set.
    pub bot_token: Option<String>,
    pub verify_init_data: bool,
    pub init_data_max_age_secs: Option<u64>,
    pub request_timeout_ms: u64,
    pub log_level: String,
    pub token_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api/".to_string(),
            auth_base_url: "http://localhost:3000/auth/".to_string(),
            bot_username: "neurolo_bot".to_string(),
            bot_token: None,
            verify_init_data: false,
            init_data_max_age_secs: Some(24 * 60 * 60),
            request_timeout_ms: 10_000,
            log_level: "info".to_string(),
            token_path: None,
        }
    }
}

impl Config {
    /// Parses a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a YAML config file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_yaml(&raw)
    }

    /// Applies `TAPFARM_*` environment overrides.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = lookup(ENV_API_BASE_URL) {
            self.api_base_url = value;
        }
        if let Some(value) = lookup(ENV_AUTH_BASE_URL) {
            self.auth_base_url = value;
        }
        if let Some(value) = lookup(ENV_BOT_TOKEN) {
            self.bot_token = Some(value);
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL) {
            self.log_level = value;
        }
        self
    }

    pub fn api_url(&self) -> Result<Url> {
        base_url(&self.api_base_url)
    }

    pub fn auth_url(&self) -> Result<Url> {
        base_url(&self.auth_base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_data_max_age(&self) -> Option<Duration> {
        self.init_data_max_age_secs.map(Duration::from_secs)
    }
}

/// Parses a base URL, requiring http(s) and a trailing slash so relative
/// joins append instead of replacing the last segment.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(Error::InvalidScheme(other.to_string())),
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

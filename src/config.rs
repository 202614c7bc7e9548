use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::error::Error;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_warning_time_ms() -> u64 {
    25 * 60 * 1000
}

fn default_timeout_duration_ms() -> u64 {
    30 * 60 * 1000
}

fn default_refresh_interval_ms() -> u64 {
    10 * 60 * 1000
}

fn default_true() -> bool {
    true
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend origin, e.g. `https://shop.example.com/api`.
    #[serde(default)]
    pub base_url: String,

    /// Headers attached to every outgoing request.
    #[serde(default)]
    pub default_headers: HashMap<String, String>,

    /// Default per-request deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Send session cookies with every request.
    #[serde(default = "default_true")]
    pub with_credentials: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
            with_credentials: true,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Idle-tracking durations. The warning period must end strictly before the
/// hard timeout, otherwise the countdown would start from a negative span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity span after which the logout warning is raised.
    #[serde(default = "default_warning_time_ms")]
    pub warning_time_ms: u64,

    /// Inactivity span after which the session is force-logged-out.
    #[serde(default = "default_timeout_duration_ms")]
    pub timeout_duration_ms: u64,

    /// Cadence of the background session keep-alive.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warning_time_ms: default_warning_time_ms(),
            timeout_duration_ms: default_timeout_duration_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn warning_time(&self) -> Duration {
        Duration::from_millis(self.warning_time_ms)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_duration_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Seconds shown on the warning countdown when it starts.
    pub fn countdown_seconds(&self) -> u64 {
        self.timeout_duration_ms.saturating_sub(self.warning_time_ms) / 1000
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.warning_time_ms == 0 {
            return Err(Error::Config("warning_time_ms must be greater than zero".to_string()));
        }
        if self.timeout_duration_ms <= self.warning_time_ms {
            return Err(Error::Config(format!(
                "timeout_duration_ms ({}) must be greater than warning_time_ms ({})",
                self.timeout_duration_ms, self.warning_time_ms
            )));
        }
        if self.refresh_interval_ms == 0 {
            return Err(Error::Config(
                "refresh_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration, loadable from a JSON file with environment
/// overrides applied on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: AppConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        Ok(cfg)
    }

    /// Environment variables override the file values:
    /// `STOREFRONT_BASE_URL`, `STOREFRONT_TIMEOUT_MS`,
    /// `STOREFRONT_WITH_CREDENTIALS`, `STOREFRONT_WARNING_TIME_MS`,
    /// `STOREFRONT_TIMEOUT_DURATION_MS`, `STOREFRONT_REFRESH_INTERVAL_MS`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STOREFRONT_BASE_URL") {
            self.client.base_url = v;
        }
        if let Some(v) = env_u64("STOREFRONT_TIMEOUT_MS") {
            self.client.timeout_ms = v;
        }
        if let Ok(v) = std::env::var("STOREFRONT_WITH_CREDENTIALS") {
            if let Ok(flag) = v.parse::<bool>() {
                self.client.with_credentials = flag;
            }
        }
        if let Some(v) = env_u64("STOREFRONT_WARNING_TIME_MS") {
            self.session.warning_time_ms = v;
        }
        if let Some(v) = env_u64("STOREFRONT_TIMEOUT_DURATION_MS") {
            self.session.timeout_duration_ms = v;
        }
        if let Some(v) = env_u64("STOREFRONT_REFRESH_INTERVAL_MS") {
            self.session.refresh_interval_ms = v;
        }
    }

    /// Load from a file, apply environment overrides, then validate.
    pub fn load(path: &str) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides();
        cfg.validate().context("validating config")?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.client.validate()?;
        self.session.validate()
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_durations() {
        let session = SessionConfig::default();
        assert_eq!(session.warning_time(), Duration::from_secs(25 * 60));
        assert_eq!(session.timeout_duration(), Duration::from_secs(30 * 60));
        assert_eq!(session.refresh_interval(), Duration::from_secs(10 * 60));
        assert_eq!(session.countdown_seconds(), 300);

        let client = ClientConfig::default();
        assert_eq!(client.timeout(), Duration::from_secs(30));
        assert!(client.with_credentials);
    }

    #[test]
    fn warning_must_end_before_timeout() {
        let session = SessionConfig {
            warning_time_ms: 30 * 60 * 1000,
            timeout_duration_ms: 25 * 60 * 1000,
            ..Default::default()
        };
        assert!(session.validate().is_err());

        let equal = SessionConfig {
            warning_time_ms: 1000,
            timeout_duration_ms: 1000,
            ..Default::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let client = ClientConfig::default();
        assert!(client.validate().is_err());
    }

    #[test]
    fn config_parses_from_file_with_partial_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "client": {{"base_url": "https://shop.example.com/api"}},
                "session": {{"warning_time_ms": 60000, "timeout_duration_ms": 120000}}
            }}"#
        )
        .unwrap();

        let cfg = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.client.base_url, "https://shop.example.com/api");
        assert_eq!(cfg.client.timeout_ms, 30_000);
        assert_eq!(cfg.session.warning_time_ms, 60_000);
        assert_eq!(cfg.session.refresh_interval_ms, 10 * 60 * 1000);
        cfg.validate().unwrap();
    }

    #[test]
    fn config_missing_file() {
        assert!(AppConfig::from_file("/nonexistent/path/config.json").is_err());
    }

    #[test]
    fn config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        assert!(AppConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"client": {{"base_url": "https://file.example.com"}}}}"#).unwrap();

        std::env::set_var("STOREFRONT_BASE_URL", "https://env.example.com");
        std::env::set_var("STOREFRONT_REFRESH_INTERVAL_MS", "5000");
        let cfg = AppConfig::load(file.path().to_str().unwrap()).unwrap();
        std::env::remove_var("STOREFRONT_BASE_URL");
        std::env::remove_var("STOREFRONT_REFRESH_INTERVAL_MS");

        assert_eq!(cfg.client.base_url, "https://env.example.com");
        assert_eq!(cfg.session.refresh_interval_ms, 5000);
    }
}

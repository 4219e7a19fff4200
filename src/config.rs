//! Configuration loading for the `skuld` CLI.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.skuld/config.toml` (user)
//! 3. `/etc/skuld/config.toml` (system)
//!
//! The API token is loaded separately:
//! 1. `~/.skuld/secrets.toml` (user, must be 0600)
//! 2. `/etc/skuld/secrets.toml` (system, must be 0600)
//! 3. `SKULD_API_TOKEN` environment variable

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::ApiClient;
use crate::query::QueryDefaults;
use crate::{Result, SkuldError};

/// Environment variable holding the API token.
pub const TOKEN_ENV_VAR: &str = "SKULD_API_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    /// Defaults for every query (`[query]` table).
    #[serde(default)]
    pub query: QueryDefaults,
}

/// REST API endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the dashboard API (default: http://localhost:8080/api).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Secrets file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path must exist. Without one, a missing user and system
    /// file yields the defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SkuldError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkuldError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(SkuldError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skuld").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/skuld/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Build an API client from `[api]` and `token`.
    pub fn api_client(&self, token: Option<String>) -> Result<ApiClient> {
        let mut builder = ApiClient::builder(&self.api.base_url)
            .timeout(Duration::from_secs(self.api.timeout_secs));
        if let Some(token) = token {
            builder = builder.token(token);
        }
        builder.build()
    }
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Returns empty secrets if no file exists.
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".skuld").join("secrets.toml");
            if user_secrets.exists() {
                return Self::load_from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/skuld/secrets.toml");
        if system_secrets.exists() {
            return Self::load_from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Read a secrets file, refusing files readable by group or others.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            SkuldError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SkuldError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            SkuldError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(SkuldError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// API token from the secrets file, falling back to `SKULD_API_TOKEN`.
    pub fn api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
            .filter(|token| !token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.api.base_url, "http://localhost:8080/api");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.query, QueryDefaults::default());
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [api]
            base_url = "https://dash.example.com/api"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api.base_url, "https://dash.example.com/api");
        // Defaults preserved
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.query.retry, 3);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [api]
            base_url = "https://dash.example.com/api"
            timeout_secs = 5

            [query]
            stale_time_ms = 60000
            cache_time_ms = 120000
            retry = 1
            retry_delay_ms = 250
            refetch_on_window_focus = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api.timeout_secs, 5);
        assert_eq!(config.query.stale_time, Duration::from_secs(60));
        assert_eq!(config.query.cache_time, Duration::from_secs(120));
        assert_eq!(config.query.retry, 1);
        assert_eq!(config.query.retry_delay, Duration::from_millis(250));
        assert!(!config.query.refetch_on_window_focus);
    }

    #[test]
    fn parse_secrets() {
        let secrets: Secrets = toml::from_str(r#"api_token = "tok-123""#).unwrap();
        assert_eq!(secrets.api_token(), Some("tok-123".to_string()));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/skuld.toml"))).unwrap_err();
        assert!(matches!(err, SkuldError::Configuration(_)));
    }
}

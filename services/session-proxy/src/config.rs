//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `API_BASE_URL` overrides `backend.base_url` so one config file can be
//! pointed at different backends per deployment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use session_auth::{
    API_TIMEOUT, DEFAULT_BACKOFF_STEP, DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, LIVENESS_TIMEOUT,
    LOGIN_PATH,
};

/// Env var that overrides `backend.base_url`.
pub const BASE_URL_ENV: &str = "API_BASE_URL";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Backend API settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Backend path probed by `/health`. Unset skips the probe.
    #[serde(default)]
    pub liveness_path: Option<String>,
}

/// Session and renewal settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Where the session survives restarts. Unset keeps it in memory only.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Share one renewal between concurrent 401s.
    #[serde(default = "default_true")]
    pub coalesce_renewals: bool,
    #[serde(default = "default_max_renewal_retries")]
    pub max_renewal_retries: u32,
    #[serde(default = "default_renewal_backoff_ms")]
    pub renewal_backoff_ms: u64,
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_timeout() -> u64 {
    API_TIMEOUT.as_secs()
}

fn default_liveness_timeout() -> u64 {
    LIVENESS_TIMEOUT.as_secs()
}

fn default_login_path() -> String {
    LOGIN_PATH.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_renewal_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_renewal_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_STEP.as_millis() as u64
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            liveness_timeout_secs: default_liveness_timeout(),
            liveness_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            login_path: default_login_path(),
            coalesce_renewals: true,
            max_renewal_retries: default_max_renewal_retries(),
            renewal_backoff_ms: default_renewal_backoff_ms(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

impl SessionConfig {
    pub fn renewal_backoff(&self) -> Duration {
        Duration::from_millis(self.renewal_backoff_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables, validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Some(base_url) = common::env_override(BASE_URL_ENV) {
            config.backend.base_url = base_url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.backend.base_url.starts_with("http://")
            && !self.backend.base_url.starts_with("https://")
        {
            return Err(common::Error::invalid_field(
                "base_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    self.backend.base_url
                ),
            ));
        }

        if self.backend.timeout_secs == 0 {
            return Err(common::Error::invalid_field(
                "timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.backend.liveness_timeout_secs == 0 {
            return Err(common::Error::invalid_field(
                "liveness_timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::invalid_field(
                "max_connections",
                "must be greater than 0",
            ));
        }

        if !self.session.login_path.starts_with('/') {
            return Err(common::Error::invalid_field(
                "login_path",
                "must be an absolute path",
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        common::resolve_config_path(cli_path, "CONFIG_PATH", "session-proxy.toml")
    }
}

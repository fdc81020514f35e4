//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from the GEMINI_API_KEYS env var or `pool.keys_file`,
//! never from the TOML itself.

use common::Secret;
use key_pool::StrategyKind;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use upstream::{ForwarderConfig, HeaderInjection};

/// Comma-separated API keys; overrides `pool.keys_file` when non-empty.
pub const KEYS_ENV: &str = "GEMINI_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
    /// Resolved API keys, in configured order.
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_openai_base_path")]
    pub openai_base_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Total upstream attempts per request; extra attempts only follow a 429.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Credential pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// File with one API key per line (blank lines and `#` comments ignored)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Per-key weights aligned with the key list (weighted strategy only)
    #[serde(default)]
    pub weights: Vec<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            strategy: StrategyKind::default(),
            keys_file: None,
            weights: Vec::new(),
        }
    }
}

fn default_api_version() -> String {
    "v1beta".into()
}

fn default_openai_base_path() -> String {
    "/v1beta/openai".into()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_cooldown_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. GEMINI_API_KEYS env var
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.keys = load_keys(&config.pool)?;

        if !config.pool.weights.is_empty() {
            if config.pool.strategy != StrategyKind::Weighted {
                warn!(
                    strategy = %config.pool.strategy,
                    "pool.weights is ignored unless strategy is weighted"
                );
            }
            if config.pool.weights.len() > config.keys.len() {
                return Err(common::Error::Config(format!(
                    "pool.weights has {} entries but only {} keys are configured",
                    config.pool.weights.len(),
                    config.keys.len()
                )));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.api_version.is_empty() || self.proxy.api_version.contains('/') {
            return Err(common::Error::Config(format!(
                "api_version must be a single path segment, got: {:?}",
                self.proxy.api_version
            )));
        }

        if !self.proxy.openai_base_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "openai_base_path must start with '/', got: {}",
                self.proxy.openai_base_path
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.proxy.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be at least 1".into(),
            ));
        }

        if self.pool.cooldown_ms == 0 {
            return Err(common::Error::Config(
                "cooldown_ms must be greater than 0".into(),
            ));
        }

        if self.pool.weights.contains(&0) {
            return Err(common::Error::Config(
                "pool.weights entries must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.pool.cooldown_ms)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            upstream_url: self.proxy.upstream_url.clone(),
            api_version: self.proxy.api_version.clone(),
            openai_base_path: self.proxy.openai_base_path.clone(),
            timeout: Duration::from_secs(self.proxy.timeout_secs),
            headers: self.headers.clone(),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-key-proxy.toml")
    }
}

fn load_keys(pool: &PoolConfig) -> common::Result<Vec<Secret<String>>> {
    if let Ok(raw) = std::env::var(KEYS_ENV) {
        let keys = parse_env_keys(&raw);
        if !keys.is_empty() {
            return Ok(keys);
        }
        warn!(env = KEYS_ENV, "env var is set but holds no keys, falling back to keys_file");
    }

    if let Some(ref keys_file) = pool.keys_file {
        let contents =
            std::fs::read_to_string(keys_file).map_err(|source| common::Error::KeysFile {
                path: keys_file.clone(),
                source,
            })?;
        let keys = parse_key_lines(&contents);
        if !keys.is_empty() {
            return Ok(keys);
        }
    }

    Err(common::Error::Config(format!(
        "no API keys configured: set {KEYS_ENV} or pool.keys_file"
    )))
}

fn parse_env_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| Secret::new(key.to_string()))
        .collect()
}

fn parse_key_lines(contents: &str) -> Vec<Secret<String>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|key| Secret::new(key.to_string()))
        .collect()
}

//! Configuration loading and resolution.
//!
//! Effective settings are merged with the precedence
//! CLI > environment > config file > built-in defaults.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cli::{Args, ConfigFormat, LogLevel};
use crate::poller::{PollSettings, DEFAULT_RETRY_INTERVAL, DEFAULT_UPDATE_INTERVAL};

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_API_BASE_URL: &str = "https://carelink.minimed.eu";
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

/// Environment variable holding the CareLink access token.
pub const TOKEN_ENV: &str = "CARELINK_TOKEN";
const PORT_ENV: &str = "PORT";
const VERBOSE_ENV: &str = "VERBOSE";

const DEFAULT_CONFIG_LOCATIONS: [&str; 9] = [
    "/etc/carelink-proxy/carelink-proxy.yaml",
    "/etc/carelink-proxy/config.yaml",
    "/etc/carelink-proxy/config.yml",
    "/etc/carelink-proxy/config.json",
    "/etc/carelink-proxy/config.toml",
    "./carelink-proxy.yaml",
    "./carelink-proxy.yml",
    "./carelink-proxy.json",
    "./carelink-proxy.toml",
];

/// Proxy configuration. Every field is optional so partial files merge
/// cleanly; the accessor methods apply the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Polling
    #[serde(alias = "update-interval", alias = "wait")]
    pub update_interval: Option<u64>,
    #[serde(alias = "retry-interval")]
    pub retry_interval: Option<u64>,

    // Remote API
    #[serde(alias = "api-base-url")]
    pub api_base_url: Option<String>,
    #[serde(alias = "request-timeout-secs")]
    pub request_timeout_secs: Option<u64>,

    // Logging
    pub log_level: Option<String>,
    pub verbose: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            update_interval: Some(DEFAULT_UPDATE_INTERVAL),
            retry_interval: Some(DEFAULT_RETRY_INTERVAL),
            api_base_url: Some(DEFAULT_API_BASE_URL.to_string()),
            request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT),
            log_level: Some("info".into()),
            verbose: Some(false),
        }
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR)
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
    }

    /// Effective log level; verbose mode forces `debug`.
    pub fn log_level(&self) -> LogLevel {
        if self.verbose.unwrap_or(false) {
            return LogLevel::Debug;
        }
        self.log_level
            .as_deref()
            .and_then(|s| LogLevel::from_str(s, true).ok())
            .unwrap_or(LogLevel::Info)
    }

    /// Timing policy handed to the poller.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            update_interval: self.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL),
            retry_interval: self.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            ..PollSettings::default()
        }
    }
}

/// Reads the access token once at startup. An empty value counts as unset.
pub fn token_from_env() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty())
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<()> {
    if cfg.bind().parse::<IpAddr>().is_err() {
        bail!("Invalid bind address '{}'", cfg.bind());
    }
    if cfg.port() == 0 {
        bail!("port must be between 1 and 65535");
    }
    if cfg.retry_interval == Some(0) {
        bail!("retry_interval must be greater than 0");
    }
    if cfg.request_timeout_secs == Some(0) {
        bail!("request_timeout_secs must be greater than 0");
    }
    if let Err(e) = reqwest::Url::parse(cfg.api_base_url()) {
        bail!("Invalid api_base_url '{}': {}", cfg.api_base_url(), e);
    }
    if let Some(level) = cfg.log_level.as_deref() {
        if LogLevel::from_str(level, true).is_err() {
            bail!(
                "Invalid log_level '{}', expected off, error, warn, info, debug or trace",
                level
            );
        }
    }
    Ok(())
}

/// Resolves configuration from CLI args, environment, config file, and defaults
pub fn resolve_config(args: &Args) -> Result<Config> {
    resolve_config_with(args, |key| std::env::var(key).ok())
}

/// Same as [`resolve_config`] with an explicit environment lookup.
pub fn resolve_config_with<F>(args: &Args, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    apply_env_overrides(&mut config, env)?;

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if let Some(wait) = args.wait {
        config.update_interval = Some(wait);
    }
    if let Some(retry) = args.retry_interval {
        config.retry_interval = Some(retry);
    }
    if let Some(url) = &args.api_base_url {
        config.api_base_url = Some(url.clone());
    }
    if let Some(level) = args.log_level {
        config.log_level = level.to_possible_value().map(|v| v.get_name().to_string());
    }
    if args.verbose {
        config.verbose = Some(true);
    }

    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = env(PORT_ENV) {
        let port = port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("Invalid {PORT_ENV} value '{port}'"))?;
        config.port = Some(port);
    }
    if let Some(verbose) = env(VERBOSE_ENV) {
        config.verbose = Some(verbose.trim().eq_ignore_ascii_case("true"));
    }
    Ok(())
}

/// Configuration loading with YAML, JSON and TOML support
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON config {}", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid TOML config {}", path.display()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML config {}", path.display()))?,
    };

    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Serializes a configuration in the requested format.
pub fn render_config(config: &Config, format: ConfigFormat) -> Result<String> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<()> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

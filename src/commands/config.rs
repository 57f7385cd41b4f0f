//! Config command implementation.
//!
//! Writes a default configuration file in YAML, JSON or TOML.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::{render_config, Config};

const DEFAULT_OUTPUT: &str = "carelink-proxy.yaml";

/// Generates configuration files
pub fn command_config(output: Option<PathBuf>, format: ConfigFormat, commented: bool) -> Result<()> {
    let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    let content = build_config_content(format, commented)?;

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

fn build_config_content(format: ConfigFormat, commented: bool) -> Result<String> {
    let content = render_config(&Config::default(), format)?;
    Ok(match format {
        ConfigFormat::Yaml if commented => add_config_comments(content),
        _ => content,
    })
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Carelink Proxy Configuration
# =============================
#
# The access token is never read from this file; set CARELINK_TOKEN.
# PORT and VERBOSE environment variables override the values below.
#
# Server Configuration
# --------------------
# bind: "0.0.0.0"              # Bind IP (0.0.0.0 = all interfaces)
# port: 8081                   # HTTP port
#
# Polling
# -------
# update_interval: 300         # Expected seconds between device uploads (--wait)
# retry_interval: 120          # Delay when the next upload time is unknown
#
# Remote API
# ----------
# api_base_url: "https://carelink.minimed.eu"
# request_timeout_secs: 30     # Per-request timeout
#
# Logging
# -------
# log_level: "info"            # off, error, warn, info, debug, trace
# verbose: false               # Same as log_level: debug
"#;

    format!("{comments}\n{yaml}")
}

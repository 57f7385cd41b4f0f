//! Check command implementation.
//!
//! Logs in with the configured token and performs a single download so the
//! operator can verify credentials and connectivity before running the proxy.

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};

use crate::client::{CarelinkClient, HttpCarelinkClient};
use crate::config::{token_from_env, Config, TOKEN_ENV};
use crate::poller::CONDUIT_UPDATE_KEY;
use crate::store::Snapshot;

/// Validates the token and remote API access.
pub async fn command_check(config: &Config) -> Result<()> {
    println!("🔍 Carelink Proxy - Connection Check");
    println!("====================================");

    let Some(token) = token_from_env() else {
        println!("   ❌ {TOKEN_ENV} env variable not set");
        bail!("{TOKEN_ENV} env variable not set");
    };

    let client = HttpCarelinkClient::new(config.api_base_url(), config.request_timeout())?;
    run_check(&client, &token).await
}

async fn run_check<C: CarelinkClient>(client: &C, token: &str) -> Result<()> {
    println!("\n🔑 Logging in...");
    if let Err(e) = client.login(token).await {
        println!("   ❌ Login failed: {}", e);
        bail!("login failed: {e}");
    }
    println!("   ✅ Login successful");

    println!("\n📥 Downloading latest data...");
    let outcome = match client.fetch_latest().await {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("   ❌ Download failed: {}", e);
            bail!("download failed: {e}");
        }
    };

    match outcome.snapshot {
        Some(snapshot) if outcome.status == 200 => {
            println!("   ✅ Response {}", outcome.status);
            match last_conduit_update(&snapshot) {
                Some(when) => println!("   📡 Last device upload: {}", when),
                None => println!("   ⚠️  No device upload time in response"),
            }
            Ok(())
        }
        _ => {
            println!("   ❌ Response {}", outcome.status);
            bail!("unexpected response {}", outcome.status);
        }
    }
}

/// Formats the snapshot's last device upload time as UTC.
fn last_conduit_update(snapshot: &Snapshot) -> Option<String> {
    let ms = snapshot.get(CONDUIT_UPDATE_KEY)?.as_i64()?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

//! CareLink cloud client.
//!
//! This module defines the `CarelinkClient` seam used by the poller and the
//! bearer-token HTTP implementation talking to the CareLink API.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::store::Snapshot;

const USER_PATH: &str = "/patient/users/me";
const DATA_PATH: &str = "/patient/connect/data";

/// Errors raised by a CareLink client call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced an HTTP response.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered 200 but the body is not JSON.
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server refused the token.
    #[error("login rejected (response {0})")]
    Rejected(u16),

    /// A fetch was attempted without a successful login.
    #[error("not logged in")]
    NotAuthenticated,
}

/// Result of one data download.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// HTTP status code returned by the server.
    pub status: u16,
    /// Decoded document, present only for a 200 response.
    pub snapshot: Option<Snapshot>,
}

impl FetchOutcome {
    pub fn new(status: u16, snapshot: Option<Snapshot>) -> Self {
        Self { status, snapshot }
    }
}

/// Remote side of the proxy: authenticate once, then download repeatedly.
#[async_trait]
pub trait CarelinkClient: Send + Sync {
    /// Validates `token` and starts a session.
    async fn login(&self, token: &str) -> Result<(), ClientError>;

    /// Downloads the most recent patient data.
    async fn fetch_latest(&self) -> Result<FetchOutcome, ClientError>;
}

/// CareLink client speaking HTTPS with a bearer token.
pub struct HttpCarelinkClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpCarelinkClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("carelink-proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl CarelinkClient for HttpCarelinkClient {
    #[instrument(skip_all)]
    async fn login(&self, token: &str) -> Result<(), ClientError> {
        // A new login always invalidates the previous session.
        *self.token.write().await = None;

        let response = self
            .http
            .get(self.url(USER_PATH))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        debug!("Login response {}", status.as_u16());
        if status != StatusCode::OK {
            return Err(ClientError::Rejected(status.as_u16()));
        }

        *self.token.write().await = Some(token.to_string());
        Ok(())
    }

    #[instrument(skip_all)]
    async fn fetch_latest(&self) -> Result<FetchOutcome, ClientError> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotAuthenticated)?;

        let request_time = chrono::Utc::now().timestamp_millis().to_string();
        let response = self
            .http
            .get(self.url(DATA_PATH))
            .bearer_auth(&token)
            .query(&[
                ("cpSerialNumber", "NONE"),
                ("msgType", "last24hours"),
                ("requestTime", request_time.as_str()),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != StatusCode::OK.as_u16() {
            debug!("Data response {} without body", status);
            return Ok(FetchOutcome::new(status, None));
        }

        let body = response.text().await?;
        let snapshot: Snapshot = serde_json::from_str(&body)?;
        Ok(FetchOutcome::new(status, Some(snapshot)))
    }
}

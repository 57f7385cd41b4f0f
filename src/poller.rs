//! Background polling of the CareLink cloud.
//!
//! The poller logs in with the configured token, downloads the latest
//! patient data, commits it to the shared `SnapshotStore` and schedules the
//! next download from the device's last upload time. It runs until the
//! shutdown channel fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{CarelinkClient, FetchOutcome};
use crate::store::{ProxyStatus, Snapshot, SnapshotStore};
use crate::transform::is_truthy;

/// Snapshot key carrying the last device upload time (epoch milliseconds).
pub const CONDUIT_UPDATE_KEY: &str = "lastConduitUpdateServerTime";

pub const DEFAULT_UPDATE_INTERVAL: u64 = 300;
pub const DEFAULT_RETRY_INTERVAL: u64 = 120;
const TOKEN_BACKOFF_SECS: u64 = 10;
const ERROR_BACKOFF_SECS: u64 = 60;
const SAFETY_MARGIN_SECS: u64 = 10;

/// Timing policy for the polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Expected seconds between two device uploads.
    pub update_interval: u64,
    /// Delay used when the next upload time cannot be predicted.
    pub retry_interval: u64,
    /// Pause before re-checking the token or retrying a login.
    pub token_backoff: Duration,
    /// Pause after a failed download.
    pub error_backoff: Duration,
    /// Added to every scheduled download delay.
    pub safety_margin: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            token_backoff: Duration::from_secs(TOKEN_BACKOFF_SECS),
            error_backoff: Duration::from_secs(ERROR_BACKOFF_SECS),
            safety_margin: Duration::from_secs(SAFETY_MARGIN_SECS),
        }
    }
}

/// Computes how long to wait before the next download.
///
/// The next upload is expected `update_interval` seconds after the last one
/// reported in the snapshot. A missing timestamp or a target already in the
/// past falls back to `retry_interval`. A target further away than
/// `update_interval + retry_interval` is capped there. The safety margin is
/// always added.
pub fn next_poll_delay(snapshot: &Snapshot, settings: &PollSettings, now_secs: f64) -> Duration {
    let scheduled = snapshot
        .get(CONDUIT_UPDATE_KEY)
        .and_then(|v| v.as_f64())
        .map(|ms| {
            let next_reading = (ms / 1000.0).trunc() + settings.update_interval as f64;
            (next_reading - now_secs).trunc()
        });

    let longest = settings
        .update_interval
        .saturating_add(settings.retry_interval);
    let secs = match scheduled {
        Some(secs) if secs >= 0.0 => (secs as u64).min(longest),
        _ => settings.retry_interval,
    };

    Duration::from_secs(secs).saturating_add(settings.safety_margin)
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Why the download loop stopped.
enum PollExit {
    Unauthorized,
    Shutdown,
}

/// Drives the login -> download -> sleep cycle.
pub struct Poller<C> {
    client: C,
    store: Arc<SnapshotStore>,
    token: Option<String>,
    settings: PollSettings,
    shutdown: watch::Receiver<bool>,
}

impl<C: CarelinkClient> Poller<C> {
    pub fn new(
        client: C,
        store: Arc<SnapshotStore>,
        token: Option<String>,
        settings: PollSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            store,
            token,
            settings,
            shutdown,
        }
    }

    /// Runs until shutdown is signalled. Never fails: every error is
    /// reported through the status and retried.
    pub async fn run(mut self) {
        info!(
            "Poller started (update interval {}s, retry interval {}s)",
            self.settings.update_interval, self.settings.retry_interval
        );

        loop {
            let Some(token) = self.token.clone() else {
                error!("CARELINK_TOKEN env variable not set");
                self.store.set_status(ProxyStatus::TokenRequired).await;
                if !self.pause(self.settings.token_backoff).await {
                    break;
                }
                continue;
            };

            self.store.set_status(ProxyStatus::PerformingLogin).await;
            match self.client.login(&token).await {
                Ok(()) => {
                    info!("Login successful");
                    self.store.set_status(ProxyStatus::LoginSuccessful).await;
                    if let PollExit::Shutdown = self.poll().await {
                        break;
                    }
                }
                Err(e) => warn!("Login failed: {}", e),
            }

            info!("{}", ProxyStatus::TokenRequired);
            self.store.set_status(ProxyStatus::TokenRequired).await;
            if !self.pause(self.settings.token_backoff).await {
                break;
            }
        }

        info!("Poller stopped");
    }

    /// Downloads until the session is rejected or shutdown is signalled.
    #[instrument(skip(self))]
    async fn poll(&mut self) -> PollExit {
        let mut download: u64 = 0;

        loop {
            download += 1;
            debug!("Starting download {}", download);

            let delay = match self.client.fetch_latest().await {
                Ok(FetchOutcome {
                    status: 200,
                    snapshot: Some(snapshot),
                }) if is_truthy(&snapshot) => {
                    debug!("New data received");
                    let delay = next_poll_delay(&snapshot, &self.settings, now_secs());
                    self.store.set(snapshot).await;
                    delay
                }
                Ok(FetchOutcome {
                    status: status @ (401 | 403),
                    ..
                }) => {
                    error!("Authorization error (response {})", status);
                    return PollExit::Unauthorized;
                }
                Ok(FetchOutcome { status, .. }) => {
                    // Keep the last good reading for readers.
                    error!("Connection error (response {})", status);
                    self.settings.error_backoff
                }
                Err(e) => {
                    error!("Download failed: {}", e);
                    self.store.clear().await;
                    self.settings.error_backoff
                }
            };

            debug!("Waiting {} seconds before next download", delay.as_secs());
            if !self.pause(delay).await {
                return PollExit::Shutdown;
            }
        }
    }

    /// Sleeps for `duration`. Returns `false` if shutdown was signalled
    /// before or during the wait.
    async fn pause(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => {
                debug!("Poller wait interrupted by shutdown");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type FetchResult = Result<FetchOutcome, ClientError>;

    /// Client replaying scripted responses. Once the fetch script runs out,
    /// further downloads hang so the poller stays parked.
    #[derive(Clone, Default)]
    struct ScriptedClient {
        logins: Arc<Mutex<VecDeque<Result<(), ClientError>>>>,
        fetches: Arc<Mutex<VecDeque<FetchResult>>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedClient {
        fn with_fetches(fetches: Vec<FetchResult>) -> Self {
            let client = Self::default();
            client.fetches.lock().unwrap().extend(fetches);
            client
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CarelinkClient for ScriptedClient {
        async fn login(&self, _token: &str) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push("login");
            self.logins.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn fetch_latest(&self) -> FetchResult {
            self.calls.lock().unwrap().push("fetch");
            let next = self.fetches.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn ok(snapshot: Snapshot) -> FetchResult {
        Ok(FetchOutcome::new(200, Some(snapshot)))
    }

    fn status(code: u16) -> FetchResult {
        Ok(FetchOutcome::new(code, None))
    }

    fn transport_error() -> FetchResult {
        let err = serde_json::from_str::<Snapshot>("{").unwrap_err();
        Err(ClientError::Decode(err))
    }

    fn start(
        client: ScriptedClient,
        token: Option<&str>,
    ) -> (
        Arc<SnapshotStore>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let store = Arc::new(SnapshotStore::new());
        let (tx, rx) = watch::channel(false);
        let poller = Poller::new(
            client,
            store.clone(),
            token.map(str::to_string),
            PollSettings::default(),
            rx,
        );
        let handle = tokio::spawn(poller.run());
        (store, tx, handle)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn test_delay_from_conduit_time() {
        let settings = PollSettings::default();
        let snapshot = json!({CONDUIT_UPDATE_KEY: 1_000_000_000_i64});
        // Last upload at t=1_000_000, next expected at t=1_000_300.
        let delay = next_poll_delay(&snapshot, &settings, 1_000_100.0);
        assert_eq!(delay, Duration::from_secs(200 + 10));
    }

    #[test]
    fn test_delay_past_target_uses_retry_interval() {
        let settings = PollSettings::default();
        let snapshot = json!({CONDUIT_UPDATE_KEY: 1_000_000_000_i64});
        let delay = next_poll_delay(&snapshot, &settings, 1_000_400.0);
        assert_eq!(delay, Duration::from_secs(120 + 10));
    }

    #[test]
    fn test_delay_truncates_toward_zero() {
        let settings = PollSettings::default();
        let snapshot = json!({CONDUIT_UPDATE_KEY: 1_000_000_999_i64});
        // Target 1_000_300, half a second late: truncates to zero, not negative.
        let delay = next_poll_delay(&snapshot, &settings, 1_000_300.5);
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_delay_without_timestamp_uses_retry_interval() {
        let settings = PollSettings::default();
        for snapshot in [json!({"patientData": {}}), json!({CONDUIT_UPDATE_KEY: "soon"})] {
            assert_eq!(
                next_poll_delay(&snapshot, &settings, 0.0),
                Duration::from_secs(130)
            );
        }
    }

    #[test]
    fn test_delay_honours_update_interval() {
        let settings = PollSettings {
            update_interval: 600,
            ..PollSettings::default()
        };
        let snapshot = json!({CONDUIT_UPDATE_KEY: 0});
        assert_eq!(
            next_poll_delay(&snapshot, &settings, 100.0),
            Duration::from_secs(500 + 10)
        );
    }

    #[test]
    fn test_delay_far_future_timestamp_is_capped() {
        let settings = PollSettings::default();
        let snapshot = json!({CONDUIT_UPDATE_KEY: 1.0e25});
        assert_eq!(
            next_poll_delay(&snapshot, &settings, 1.7e9),
            Duration::from_secs(300 + 120 + 10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_reports_status_forever() {
        let client = ScriptedClient::default();
        let (store, tx, handle) = start(client.clone(), None);

        advance(1).await;
        assert_eq!(store.status().await, ProxyStatus::TokenRequired);

        advance(600).await;
        assert_eq!(store.status().await, ProxyStatus::TokenRequired);
        assert!(!handle.is_finished());
        assert!(client.calls().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_fetch_commits_snapshot() {
        let snapshot = json!({"patientData": {"sgs": [{"value": 120}]}});
        let client = ScriptedClient::with_fetches(vec![ok(snapshot.clone())]);
        let (store, tx, handle) = start(client.clone(), Some("token"));

        advance(1).await;
        assert_eq!(store.status().await, ProxyStatus::LoginSuccessful);
        assert_eq!(*store.get().await.unwrap(), snapshot);
        assert_eq!(client.calls(), vec!["login", "fetch"]);

        // No timestamp: next download after retry interval plus margin.
        advance(128).await;
        assert_eq!(client.calls(), vec!["login", "fetch"]);
        advance(2).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "fetch"]);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_fetch_triggers_login() {
        let client = ScriptedClient::with_fetches(vec![status(401)]);
        let (store, tx, handle) = start(client.clone(), Some("token"));

        advance(1).await;
        assert_eq!(client.calls(), vec!["login", "fetch"]);
        assert_eq!(store.status().await, ProxyStatus::TokenRequired);

        // Re-authentication after the login backoff, well before the
        // download retry backoff would have expired.
        advance(10).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "login", "fetch"]);
        assert_eq!(store.status().await, ProxyStatus::LoginSuccessful);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_fetch_triggers_login() {
        let client = ScriptedClient::with_fetches(vec![status(403)]);
        let (_store, tx, handle) = start(client.clone(), Some("token"));

        advance(11).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "login", "fetch"]);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_clears_snapshot() {
        let client = ScriptedClient::with_fetches(vec![
            ok(json!({"patientData": {"sgs": []}})),
            transport_error(),
        ]);
        let (store, tx, handle) = start(client.clone(), Some("token"));

        advance(1).await;
        assert!(store.get().await.is_some());

        advance(130).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "fetch"]);
        assert!(store.get().await.is_none());

        // Retried in place after the error backoff, no new login.
        advance(60).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "fetch", "fetch"]);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_status_keeps_snapshot() {
        let snapshot = json!({"patientData": {"sgs": [{"value": 99}]}});
        let client = ScriptedClient::with_fetches(vec![ok(snapshot.clone()), status(500)]);
        let (store, tx, handle) = start(client.clone(), Some("token"));

        advance(131).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "fetch"]);
        assert_eq!(*store.get().await.unwrap(), snapshot);
        assert_eq!(store.status().await, ProxyStatus::LoginSuccessful);

        advance(58).await;
        assert_eq!(client.calls().len(), 3);
        advance(2).await;
        assert_eq!(client.calls().len(), 4);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ok_response_is_transient() {
        let client = ScriptedClient::with_fetches(vec![ok(json!({}))]);
        let (store, tx, handle) = start(client.clone(), Some("token"));

        advance(1).await;
        assert!(store.get().await.is_none());

        advance(60).await;
        assert_eq!(client.calls(), vec!["login", "fetch", "fetch"]);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_retries_after_backoff() {
        let client = ScriptedClient::default();
        client
            .logins
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Rejected(401)));
        let (store, tx, handle) = start(client.clone(), Some("expired"));

        advance(1).await;
        assert_eq!(client.calls(), vec!["login"]);
        assert_eq!(store.status().await, ProxyStatus::TokenRequired);

        advance(10).await;
        assert_eq!(client.calls(), vec!["login", "login", "fetch"]);

        tx.send(true).unwrap();
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_long_wait() {
        let snapshot = json!({"patientData": {"sgs": []}});
        let client = ScriptedClient::with_fetches(vec![ok(snapshot)]);
        let (_store, tx, handle) = start(client, Some("token"));

        advance(1).await;
        tx.send(true).unwrap();

        // The poller sits in a 130s wait; it must return right away.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}

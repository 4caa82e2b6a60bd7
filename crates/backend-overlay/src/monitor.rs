use std::{sync::Arc, time::Duration};

use backend_core::{NetworkHealth, OverlayStatus};
use serde::Deserialize;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_OVERLAY_URL: &str = "http://localhost:8989";
pub const DEFAULT_ADMIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PEERS_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Base address of the overlay daemon's HTTP API.
    pub base_url: String,
    pub admin_timeout: Duration,
    pub peers_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OVERLAY_URL.to_owned(),
            admin_timeout: DEFAULT_ADMIN_TIMEOUT,
            peers_timeout: DEFAULT_PEERS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// One peer as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OverlayPeer {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    #[serde(default)]
    peers: Vec<OverlayPeer>,
}

/// Polls the overlay daemon and caches the last complete status.
#[derive(Debug)]
pub struct OverlayMonitor {
    http: reqwest::Client,
    config: OverlayConfig,
    status_tx: watch::Sender<OverlayStatus>,
    // Held for the duration of a poll; stores when the last poll finished.
    poll_gate: Mutex<Option<Instant>>,
}

impl OverlayMonitor {
    pub fn new(config: OverlayConfig) -> Self {
        let (status_tx, _) = watch::channel(OverlayStatus::default());
        Self {
            http: reqwest::Client::builder().build().unwrap_or_default(),
            config,
            status_tx,
            poll_gate: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Query the daemon once and replace the cached status.
    ///
    /// Never fails: every outcome, including timeouts, is a complete status.
    pub async fn poll(&self) -> OverlayStatus {
        let mut last_poll = self.poll_gate.lock().await;
        self.poll_locked(&mut last_poll).await
    }

    /// Return the cached status if a poll finished within `max_age`, else poll.
    ///
    /// Callers that arrive while another poll is in flight wait for it and reuse it.
    pub async fn poll_if_stale(&self, max_age: Duration) -> OverlayStatus {
        let mut last_poll = self.poll_gate.lock().await;
        if let Some(finished) = *last_poll
            && finished.elapsed() <= max_age
        {
            return self.current_status();
        }
        self.poll_locked(&mut last_poll).await
    }

    pub fn current_status(&self) -> OverlayStatus {
        self.status_tx.borrow().clone()
    }

    pub fn current_health(&self) -> NetworkHealth {
        self.status_tx.borrow().health()
    }

    /// Observe each status replacement.
    pub fn watch(&self) -> watch::Receiver<OverlayStatus> {
        self.status_tx.subscribe()
    }

    /// Peers from `GET /api/v1/peers`; absence or failure of the endpoint is an empty list.
    pub async fn peers(&self) -> Vec<OverlayPeer> {
        let url = self.endpoint("/api/v1/peers");
        let response = match self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.peers_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "overlay peers request failed");
                return Vec::new();
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("overlay peers endpoint not available");
            return Vec::new();
        }
        if !status.is_success() {
            debug!(status = status.as_u16(), "overlay peers endpoint rejected request");
            return Vec::new();
        }

        match response.json::<PeersResponse>().await {
            Ok(body) => body.peers,
            Err(err) => {
                debug!(error = %err, "overlay peers response could not be decoded");
                Vec::new()
            }
        }
    }

    /// Start the periodic poll loop; the first poll runs immediately.
    pub fn spawn_polling(self: &Arc<Self>) -> PollingHandle {
        let monitor = Arc::clone(self);
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let interval = self.config.poll_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // The next tick is only awaited after this poll settles.
                tokio::select! {
                    biased;
                    _ = stop_child.cancelled() => break,
                    status = monitor.poll() => {
                        debug!(
                            detected = status.detected,
                            peers = status.peer_count,
                            health = status.health().as_str(),
                            "overlay poll finished"
                        );
                    }
                }
            }
            debug!("overlay polling stopped");
        });

        PollingHandle {
            stop,
            task: Some(task),
        }
    }

    async fn poll_locked(&self, last_poll: &mut Option<Instant>) -> OverlayStatus {
        let status = self.fetch_status().await;
        let previous = self.status_tx.send_replace(status.clone());
        if previous.detected != status.detected {
            if status.detected {
                info!(peers = status.peer_count, "overlay daemon detected");
            } else {
                warn!(
                    error = status.error.as_deref().unwrap_or_default(),
                    "overlay daemon no longer detected"
                );
            }
        }
        *last_poll = Some(Instant::now());
        status
    }

    async fn fetch_status(&self) -> OverlayStatus {
        let url = self.endpoint("/api/v1/admin");
        let response = match self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.admin_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return OverlayStatus::undetected(err.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            return OverlayStatus::undetected(format!("HTTP {}", status.as_u16()));
        }

        // The admin body is informational; an unreadable body still means detected.
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        let version = body
            .get("version")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        let peer_count = match body.get("peers").and_then(serde_json::Value::as_array) {
            Some(peers) => peers.len(),
            None => self.peers().await.len(),
        };

        OverlayStatus::detected(version, u32::try_from(peer_count).unwrap_or(u32::MAX))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

/// Caller-owned handle for the polling loop. Dropping it stops polling.
#[derive(Debug)]
pub struct PollingHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollingHandle {
    /// Cancel the loop and wait until it has exited.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

use std::{sync::Arc, time::Duration};

use backend_core::{ConnectionMode, OverlayStatus};
use tracing::debug;

use crate::monitor::OverlayMonitor;

pub const DEFAULT_REUSE_WINDOW: Duration = Duration::from_secs(1);

/// Mode decision together with the status it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: ConnectionMode,
    pub status: OverlayStatus,
}

/// Chooses the transport mode from a fresh (or just-completed) overlay poll.
#[derive(Debug, Clone)]
pub struct ConnectionModeSelector {
    monitor: Arc<OverlayMonitor>,
    reuse_window: Duration,
}

impl ConnectionModeSelector {
    pub fn new(monitor: Arc<OverlayMonitor>) -> Self {
        Self::with_reuse_window(monitor, DEFAULT_REUSE_WINDOW)
    }

    pub fn with_reuse_window(monitor: Arc<OverlayMonitor>, reuse_window: Duration) -> Self {
        Self {
            monitor,
            reuse_window,
        }
    }

    pub fn monitor(&self) -> &Arc<OverlayMonitor> {
        &self.monitor
    }

    pub async fn select_mode(&self) -> ConnectionMode {
        self.decide().await.mode
    }

    pub async fn decide(&self) -> ModeDecision {
        let status = self.monitor.poll_if_stale(self.reuse_window).await;
        let mode = ConnectionMode::for_status(&status);
        debug!(
            mode = mode.as_str(),
            detected = status.detected,
            "connection mode selected"
        );
        ModeDecision { mode, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::OverlayConfig;

    fn selector(url: String, reuse_window: Duration) -> ConnectionModeSelector {
        let monitor = OverlayMonitor::new(OverlayConfig {
            base_url: url,
            admin_timeout: Duration::from_millis(500),
            peers_timeout: Duration::from_millis(500),
            ..OverlayConfig::default()
        });
        ConnectionModeSelector::with_reuse_window(Arc::new(monitor), reuse_window)
    }

    #[tokio::test]
    async fn enhanced_only_when_detected() {
        let mut server = mockito::Server::new_async().await;
        let up = server
            .mock("GET", "/api/v1/admin")
            .with_status(200)
            .with_body(r#"{"peers":[]}"#)
            .create_async()
            .await;

        let selector = selector(server.url(), Duration::ZERO);
        assert_eq!(selector.select_mode().await, ConnectionMode::Enhanced);

        up.remove_async().await;
        server
            .mock("GET", "/api/v1/admin")
            .with_status(503)
            .create_async()
            .await;

        assert_eq!(selector.select_mode().await, ConnectionMode::Standard);
    }

    #[tokio::test]
    async fn captured_decision_does_not_change_after_flip() {
        let mut server = mockito::Server::new_async().await;
        let up = server
            .mock("GET", "/api/v1/admin")
            .with_status(200)
            .with_body(r#"{"peers":[]}"#)
            .create_async()
            .await;

        let selector = selector(server.url(), Duration::ZERO);
        let captured = selector.decide().await;

        up.remove_async().await;
        let next = selector.decide().await;

        assert_eq!(captured.mode, ConnectionMode::Enhanced);
        assert_eq!(next.mode, ConnectionMode::Standard);
    }

    #[tokio::test]
    async fn unreachable_daemon_selects_standard() {
        let selector = selector("http://127.0.0.1:9".to_owned(), DEFAULT_REUSE_WINDOW);
        let decision = selector.decide().await;
        assert_eq!(decision.mode, ConnectionMode::Standard);
        assert!(decision.status.error.is_some());
    }
}

//! Overlay daemon health monitoring and transport mode selection.

mod monitor;
mod selector;

pub use monitor::{
    DEFAULT_ADMIN_TIMEOUT, DEFAULT_OVERLAY_URL, DEFAULT_PEERS_TIMEOUT, DEFAULT_POLL_INTERVAL,
    OverlayConfig, OverlayMonitor, OverlayPeer, PollingHandle,
};
pub use selector::{ConnectionModeSelector, DEFAULT_REUSE_WINDOW, ModeDecision};

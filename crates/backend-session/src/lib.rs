//! Session orchestration over the gateway, the overlay selector, and a
//! protocol-client handle, plus per-room timeline synchronization.

mod endpoints;
mod manager;
mod rooms;
mod timeline;

#[cfg(test)]
mod testing;

use std::{future::Future, time::Duration};

use backend_core::BackendError;

pub use endpoints::{DEFAULT_BRIDGE_URL, DEFAULT_ORIGIN_SCHEME, TransportEndpoints};
pub use manager::{DEFAULT_PROTOCOL_TIMEOUT, SessionConfig, SessionDeps, SessionManager};
pub use rooms::RoomService;
pub use timeline::{
    LiveListeners, MessageCallback, TimelineConfig, TimelineSelection, TimelineSynchronizer,
};

/// Run an external call under `limit`; expiry is a `Network/timeout` error.
pub(crate) async fn bounded<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BackendError::timeout(operation, limit))?
}

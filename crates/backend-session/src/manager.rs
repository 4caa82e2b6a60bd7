use std::{sync::Arc, time::Duration};

use backend_core::{
    BackendError, BackendErrorCategory, ConnectionMode, EventHub, ProtocolClient,
    ProtocolClientFactory, Session, SessionEvent, SessionState, SessionStateMachine, SyncStatus,
};
use backend_gateway::GatewayClient;
use backend_overlay::ConnectionModeSelector;
use backend_platform::SessionStore;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{bounded, endpoints::TransportEndpoints};

pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound for every protocol-client call the manager makes.
    pub protocol_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Collaborators injected into a [`SessionManager`].
pub struct SessionDeps {
    pub gateway: GatewayClient,
    pub selector: ConnectionModeSelector,
    pub factory: Arc<dyn ProtocolClientFactory>,
    pub store: Arc<dyn SessionStore>,
    pub endpoints: TransportEndpoints,
}

#[derive(Default)]
struct SessionInner {
    machine: SessionStateMachine,
    session: Option<Session>,
    protocol: Option<Arc<dyn ProtocolClient>>,
    degraded: bool,
    // Bumped by logout and invalidation; flows started under an older epoch are discarded.
    epoch: u64,
}

/// Owns the session, its protocol handle, and the persisted session record.
pub struct SessionManager {
    gateway: GatewayClient,
    selector: ConnectionModeSelector,
    factory: Arc<dyn ProtocolClientFactory>,
    store: Arc<dyn SessionStore>,
    endpoints: TransportEndpoints,
    config: SessionConfig,
    events: EventHub<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        Self {
            gateway: deps.gateway,
            selector: deps.selector,
            factory: deps.factory,
            store: deps.store,
            endpoints: deps.endpoints,
            events: EventHub::new(config.event_buffer),
            config,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventHub<SessionEvent> {
        &self.events
    }

    pub fn gateway(&self) -> &GatewayClient {
        &self.gateway
    }

    pub fn selector(&self) -> &ConnectionModeSelector {
        &self.selector
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.machine.state()
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    /// Mode of the live handle, fixed until the next login, restore, or reconnect.
    pub async fn connection_mode(&self) -> Option<ConnectionMode> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.connection_mode)
    }

    /// Live sync could not be established for the current handle.
    pub async fn is_degraded(&self) -> bool {
        self.inner.lock().await.degraded
    }

    pub async fn protocol_client(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.inner.lock().await.protocol.clone()
    }

    /// Session and handle, or `invalid_state_transition` when not authenticated.
    pub async fn authenticated(
        &self,
        action: &str,
    ) -> Result<(Session, Arc<dyn ProtocolClient>), BackendError> {
        let inner = self.inner.lock().await;
        inner.machine.require_authenticated(action)?;
        match (&inner.session, &inner.protocol) {
            (Some(session), Some(protocol)) => Ok((session.clone(), Arc::clone(protocol))),
            _ => Err(BackendError::invalid_state(inner.machine.state(), action)),
        }
    }

    /// Exchange credentials at the gateway and build a handle for the selected transport.
    ///
    /// There is no protocol-level login fallback; the gateway is the only credential authority.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        server_name: &str,
    ) -> Result<Session, BackendError> {
        let epoch = self.begin_auth("login").await?;
        info!(username, server_name, "login started");

        let auth = match self.gateway.login(username, password).await {
            Ok(auth) => auth,
            Err(err) => return Err(self.fail_auth(epoch, err.into()).await),
        };

        let mut session = Session {
            user_id: auth.user_id,
            access_token: auth.access_token,
            device_id: auth.device_id.unwrap_or_else(generated_device_id),
            server_name: server_name.to_owned(),
            connection_mode: ConnectionMode::Standard,
        };
        let protocol = match self.connect_protocol(&mut session).await {
            Ok(protocol) => protocol,
            Err(err) => return Err(self.fail_auth(epoch, err).await),
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                info!(user_id = %session.user_id, "login superseded by logout; discarding");
                return Err(flow_cancelled("login"));
            }
            if let Err(err) = self.store.save(&session) {
                let err = BackendError::from(err);
                error!(error = %err, "failed persisting session");
                self.fail_auth_locked(&mut inner, &err);
                return Err(err);
            }
            self.commit_locked(&mut inner, session.clone(), Arc::clone(&protocol))?;
        }

        // A sync failure leaves the session usable but degraded.
        let _ = self.start_live_sync(epoch, protocol).await;
        Ok(session)
    }

    /// Rebuild the session persisted by a previous run, recomputing the transport mode.
    ///
    /// Returns `Ok(None)` when there is nothing (usable) to restore.
    pub async fn restore(&self) -> Result<Option<Session>, BackendError> {
        let epoch = self.begin_auth("restore").await?;

        let stored = match self.store.load() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("no persisted session");
                self.abandon_auth(epoch).await;
                return Ok(None);
            }
            Err(err) if err.is_stale_record() => {
                warn!(error = %err, "discarding unreadable session record");
                self.clear_store_best_effort();
                self.events
                    .emit(SessionEvent::warning(&BackendError::from(err)));
                self.abandon_auth(epoch).await;
                return Ok(None);
            }
            Err(err) => return Err(self.fail_auth(epoch, err.into()).await),
        };

        let persisted_mode = stored.connection_mode;
        let mut session = stored;
        let protocol = match self.connect_protocol(&mut session).await {
            Ok(protocol) => protocol,
            Err(err) => {
                if err.is_auth() {
                    warn!(error = %err, "persisted session is stale; clearing");
                    self.clear_store_best_effort();
                }
                return Err(self.fail_auth(epoch, err).await);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(flow_cancelled("restore"));
            }
            if let Err(err) = self.store.save(&session) {
                warn!(error = %err, "failed re-persisting restored session");
            }
            self.commit_locked(&mut inner, session.clone(), Arc::clone(&protocol))?;
        }
        info!(
            user_id = %session.user_id,
            persisted_mode = persisted_mode.as_str(),
            mode = session.connection_mode.as_str(),
            "session restored"
        );

        if let Err(err) = self.start_live_sync(epoch, protocol).await
            && err.is_auth()
        {
            warn!(error = %err, "restored session rejected by server; clearing");
            self.invalidate(epoch, &err).await;
            return Err(err);
        }
        Ok(Some(session))
    }

    /// Replace the protocol handle for the current session, selecting the mode afresh.
    ///
    /// The previous handle is stopped, never re-addressed.
    pub async fn reconnect(&self) -> Result<Session, BackendError> {
        let (epoch, mut session) = {
            let inner = self.inner.lock().await;
            inner.machine.require_authenticated("reconnect")?;
            let session = inner
                .session
                .clone()
                .ok_or_else(|| BackendError::invalid_state(inner.machine.state(), "reconnect"))?;
            (inner.epoch, session)
        };

        let protocol = self.connect_protocol(&mut session).await?;
        let previous = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(flow_cancelled("reconnect"));
            }
            if let Err(err) = self.store.save(&session) {
                warn!(error = %err, "failed persisting reconnected session");
            }
            inner.session = Some(session.clone());
            inner.degraded = false;
            inner.protocol.replace(Arc::clone(&protocol))
        };

        if let Some(previous) = previous
            && let Err(err) = bounded(
                "stop previous sync",
                self.config.protocol_timeout,
                previous.stop_sync(),
            )
            .await
        {
            warn!(error = %err, "failed stopping previous protocol handle");
        }

        info!(mode = session.connection_mode.as_str(), "protocol handle recreated");
        self.start_live_sync(epoch, protocol).await?;
        Ok(session)
    }

    /// End the session. Remote invalidation is best-effort; the local record is always cleared.
    pub async fn logout(&self) -> Result<(), BackendError> {
        let (session, protocol) = {
            let mut inner = self.inner.lock().await;
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.degraded = false;
            if let Some(event) = inner.machine.on_logout() {
                self.events.emit(event);
            }
            (inner.session.take(), inner.protocol.take())
        };
        info!(had_session = session.is_some(), "logout started");

        if let Some(protocol) = &protocol {
            let limit = self.config.protocol_timeout;
            if let Err(err) = bounded("stop sync", limit, protocol.stop_sync()).await {
                warn!(error = %err, "failed stopping live sync during logout");
            }
            if let Err(err) = bounded("protocol logout", limit, protocol.logout()).await {
                warn!(error = %err, "protocol logout failed; continuing local cleanup");
            }
        }
        if let Some(session) = &session
            && let Err(err) = self.gateway.logout(Some(&session.access_token)).await
        {
            warn!(error = %err, "gateway logout failed; continuing local cleanup");
        }

        self.store.clear().map_err(|err| {
            let err = BackendError::from(err);
            error!(error = %err, "failed clearing persisted session");
            err
        })?;
        info!("logged out");
        Ok(())
    }

    async fn begin_auth(&self, action: &str) -> Result<u64, BackendError> {
        let mut inner = self.inner.lock().await;
        let event = inner.machine.begin_auth(action).map_err(|err| {
            warn!(action, code = %err.code, "auth flow rejected");
            err
        })?;
        self.events.emit(event);
        Ok(inner.epoch)
    }

    async fn connect_protocol(
        &self,
        session: &mut Session,
    ) -> Result<Arc<dyn ProtocolClient>, BackendError> {
        let decision = self.selector.decide().await;
        let base_url = self
            .endpoints
            .base_url_for(decision.mode, &session.server_name);
        session.connection_mode = decision.mode;
        info!(
            mode = decision.mode.as_str(),
            base_url = %base_url,
            overlay_health = decision.status.health().as_str(),
            "transport selected"
        );
        self.events.emit(SessionEvent::ModeSelected {
            mode: decision.mode,
            base_url: base_url.clone(),
        });

        bounded(
            "connect protocol client",
            self.config.protocol_timeout,
            self.factory.connect(&base_url, session),
        )
        .await
    }

    /// Start live sync on `protocol` if it is still the current handle.
    async fn start_live_sync(
        &self,
        epoch: u64,
        protocol: Arc<dyn ProtocolClient>,
    ) -> Result<(), BackendError> {
        let limit = self.config.protocol_timeout;
        let result = bounded("start sync", limit, protocol.start_sync()).await;

        let mut inner = self.inner.lock().await;
        let still_current = inner.epoch == epoch
            && inner
                .protocol
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &protocol));
        if !still_current {
            drop(inner);
            if result.is_ok() {
                let _ = bounded("stop sync", limit, protocol.stop_sync()).await;
            }
            return Ok(());
        }

        match result {
            Ok(()) => {
                inner.degraded = false;
                self.events.emit(SessionEvent::SyncStatus(SyncStatus {
                    running: true,
                    degraded: false,
                    lag_hint_ms: None,
                }));
                Ok(())
            }
            Err(err) => {
                inner.degraded = true;
                warn!(error = %err, "live sync unavailable; session is degraded");
                self.events.emit(SessionEvent::SyncStatus(SyncStatus {
                    running: false,
                    degraded: true,
                    lag_hint_ms: None,
                }));
                self.events.emit(SessionEvent::warning(&err));
                Err(err)
            }
        }
    }

    fn commit_locked(
        &self,
        inner: &mut SessionInner,
        session: Session,
        protocol: Arc<dyn ProtocolClient>,
    ) -> Result<(), BackendError> {
        let event = inner.machine.on_auth_result(true)?;
        info!(
            user_id = %session.user_id,
            mode = session.connection_mode.as_str(),
            "session authenticated"
        );
        inner.session = Some(session);
        inner.protocol = Some(protocol);
        inner.degraded = false;
        self.events.emit(event);
        self.events.emit(SessionEvent::AuthResult {
            success: true,
            error_code: None,
        });
        Ok(())
    }

    async fn fail_auth(&self, epoch: u64, err: BackendError) -> BackendError {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            self.fail_auth_locked(&mut inner, &err);
        }
        err
    }

    fn fail_auth_locked(&self, inner: &mut SessionInner, err: &BackendError) {
        warn!(code = %err.code, error = %err.message, "authentication failed");
        if let Ok(event) = inner.machine.on_auth_result(false) {
            self.events.emit(event);
        }
        self.events.emit(SessionEvent::AuthResult {
            success: false,
            error_code: Some(err.code.clone()),
        });
    }

    async fn abandon_auth(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch
            && let Ok(event) = inner.machine.on_auth_result(false)
        {
            self.events.emit(event);
        }
    }

    /// Force the session back to `Anonymous` after the server rejected it.
    async fn invalidate(&self, epoch: u64, err: &BackendError) {
        let protocol = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.epoch = inner.epoch.wrapping_add(1);
            inner.degraded = false;
            inner.session = None;
            if let Some(event) = inner.machine.on_logout() {
                self.events.emit(event);
            }
            inner.protocol.take()
        };
        drop(protocol);
        self.clear_store_best_effort();
        self.events.emit(SessionEvent::AuthResult {
            success: false,
            error_code: Some(err.code.clone()),
        });
    }

    fn clear_store_best_effort(&self) {
        if let Err(err) = self.store.clear() {
            error!(error = %err, "failed clearing persisted session");
        }
    }
}

fn flow_cancelled(flow: &str) -> BackendError {
    BackendError::new(
        BackendErrorCategory::Conflict,
        format!("{flow}_cancelled"),
        format!("{flow} was superseded by a logout"),
    )
}

fn generated_device_id() -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("MYCO{}", &id[..10])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BRIDGE_URL, Harness};
    use backend_platform::InMemorySessionStore;

    fn persisted(mode: ConnectionMode) -> Session {
        Session {
            user_id: "@alice:matrix.org".to_owned(),
            access_token: "tok".to_owned(),
            device_id: "DEV1".to_owned(),
            server_name: "matrix.org".to_owned(),
            connection_mode: mode,
        }
    }

    #[tokio::test]
    async fn login_with_overlay_down_addresses_origin_server() {
        let mut harness = Harness::new(false).await;
        let session = harness.login().await;

        assert_eq!(session.connection_mode, ConnectionMode::Standard);
        assert_eq!(harness.manager.state().await, SessionState::Authenticated);
        let connects = harness.factory.connects();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].0, "https://matrix.org");
        assert_eq!(connects[0].1.access_token, "tok");
        assert_eq!(
            harness.store.load().expect("load"),
            Some(session.clone()),
            "the session is persisted"
        );
        assert!(!harness.manager.is_degraded().await);
        assert!(harness.factory.last_handle().calls().contains(&"start_sync".to_owned()));
    }

    #[tokio::test]
    async fn login_with_overlay_up_addresses_bridge() {
        let mut harness = Harness::new(true).await;
        let session = harness.login().await;

        assert_eq!(session.connection_mode, ConnectionMode::Enhanced);
        assert_eq!(harness.factory.connects()[0].0, BRIDGE_URL);
        assert_eq!(
            harness.manager.connection_mode().await,
            Some(ConnectionMode::Enhanced)
        );
    }

    #[tokio::test]
    async fn gateway_rejection_returns_to_anonymous_without_protocol_attempt() {
        let mut harness = Harness::new(true).await;
        let _login = harness
            .gateway
            .mock("POST", "/api/auth/login")
            .with_status(401)
            .with_body(r#"{"success":false,"error":"invalid credentials"}"#)
            .create_async()
            .await;
        let mut events = harness.manager.subscribe();

        let err = harness
            .manager
            .login("alice", "wrong", "matrix.org")
            .await
            .expect_err("login must fail");

        assert!(err.is_auth());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
        assert!(harness.factory.connects().is_empty());
        assert!(harness.store.is_empty());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::AuthResult { success, error_code } = event {
                assert!(!success);
                assert_eq!(error_code.as_deref(), Some("gateway_http_error"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn concurrent_login_is_rejected() {
        let mut harness = Harness::new(false).await;
        let _login = harness.mock_login_ok().await;
        *harness.factory.connect_delay.lock().expect("lock") = Some(Duration::from_millis(200));

        let manager = &harness.manager;
        let (first, second) = tokio::join!(
            manager.login("alice", "hunter2", "matrix.org"),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                manager.login("alice", "hunter2", "matrix.org").await
            }
        );

        first.expect("first login should succeed");
        let err = second.expect_err("second login must be rejected");
        assert_eq!(err.code, "auth_in_flight");
        assert_eq!(harness.factory.handle_count(), 1);
        assert_eq!(manager.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn sync_failure_keeps_session_authenticated_but_degraded() {
        let mut harness = Harness::new(false).await;
        *harness.factory.start_sync_error.lock().expect("lock") = Some(BackendError::transport(
            "matrix_http_error",
            "connection reset",
        ));
        let mut events = harness.manager.subscribe();

        harness.login().await;

        assert_eq!(harness.manager.state().await, SessionState::Authenticated);
        assert!(harness.manager.is_degraded().await);
        let mut saw_degraded = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SyncStatus(status) = event {
                saw_degraded |= status.degraded && !status.running;
            }
        }
        assert!(saw_degraded);
    }

    #[tokio::test]
    async fn restore_recomputes_mode_instead_of_trusting_record() {
        let store = InMemorySessionStore::default();
        store
            .save(&persisted(ConnectionMode::Enhanced))
            .expect("seed record");
        let harness = Harness::with_store(false, store).await;

        let restored = harness
            .manager
            .restore()
            .await
            .expect("restore should succeed")
            .expect("a session should be restored");

        assert_eq!(restored.connection_mode, ConnectionMode::Standard);
        assert_eq!(harness.factory.connects()[0].0, "https://matrix.org");
        assert_eq!(
            harness.store.load().expect("load").map(|s| s.connection_mode),
            Some(ConnectionMode::Standard)
        );
        assert_eq!(harness.manager.state().await, SessionState::Authenticated);
    }

    #[tokio::test]
    async fn restore_without_record_stays_anonymous() {
        let harness = Harness::new(true).await;
        assert_eq!(harness.manager.restore().await.expect("restore"), None);
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
        assert!(harness.factory.connects().is_empty());
    }

    #[tokio::test]
    async fn restore_discards_corrupt_or_future_records() {
        let store = InMemorySessionStore::with_raw(br#"{"version":7,"session":{}}"#.to_vec());
        let harness = Harness::with_store(false, store).await;

        assert_eq!(harness.manager.restore().await.expect("restore"), None);
        assert!(harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn stale_credentials_clear_record_on_restore() {
        let store = InMemorySessionStore::default();
        store
            .save(&persisted(ConnectionMode::Standard))
            .expect("seed record");
        let harness = Harness::with_store(false, store).await;
        *harness.factory.connect_error.lock().expect("lock") = Some(
            BackendError::from_http_status(401, "matrix_http_error", "M_UNKNOWN_TOKEN"),
        );

        let err = harness.manager.restore().await.expect_err("restore must fail");
        assert!(err.is_auth());
        assert!(harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn sync_rejection_on_restore_is_treated_as_stale() {
        let store = InMemorySessionStore::default();
        store
            .save(&persisted(ConnectionMode::Standard))
            .expect("seed record");
        let harness = Harness::with_store(false, store).await;
        *harness.factory.start_sync_error.lock().expect("lock") = Some(
            BackendError::from_http_status(401, "matrix_http_error", "M_UNKNOWN_TOKEN"),
        );

        let err = harness.manager.restore().await.expect_err("restore must fail");
        assert!(err.is_auth());
        assert!(harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
        assert!(harness.manager.protocol_client().await.is_none());
    }

    #[tokio::test]
    async fn network_failure_on_restore_keeps_record() {
        let store = InMemorySessionStore::default();
        store
            .save(&persisted(ConnectionMode::Standard))
            .expect("seed record");
        let harness = Harness::with_store(false, store).await;
        *harness.factory.connect_error.lock().expect("lock") =
            Some(BackendError::transport("matrix_http_error", "dns failure"));

        let err = harness.manager.restore().await.expect_err("restore must fail");
        assert!(err.is_recoverable());
        assert!(!harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn logout_clears_record_even_when_remote_calls_fail() {
        let mut harness = Harness::new(false).await;
        harness.login().await;
        let handle = harness.factory.last_handle();
        *handle.logout_error.lock().expect("lock") =
            Some(BackendError::transport("matrix_http_error", "network down"));
        let _gateway_logout = harness
            .gateway
            .mock("POST", "/api/auth/logout")
            .with_status(503)
            .create_async()
            .await;

        harness.manager.logout().await.expect("local logout succeeds");

        assert!(harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
        assert!(harness.manager.session().await.is_none());
        let calls = handle.calls();
        assert!(calls.contains(&"stop_sync".to_owned()));
        assert!(calls.contains(&"logout".to_owned()));
    }

    #[tokio::test]
    async fn logout_wins_over_in_flight_login() {
        let mut harness = Harness::new(false).await;
        let _login = harness.mock_login_ok().await;
        *harness.factory.connect_delay.lock().expect("lock") = Some(Duration::from_millis(300));

        let manager = Arc::clone(&harness.manager);
        let login = tokio::spawn(async move { manager.login("alice", "hunter2", "matrix.org").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.manager.logout().await.expect("logout");

        let err = login
            .await
            .expect("task should join")
            .expect_err("login must be discarded");
        assert_eq!(err.code, "login_cancelled");
        assert!(harness.store.is_empty());
        assert_eq!(harness.manager.state().await, SessionState::Anonymous);
        assert!(harness.manager.protocol_client().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_selects_fresh_mode_and_clears_degraded_flag() {
        let mut harness = Harness::new(false).await;
        *harness.factory.start_sync_error.lock().expect("lock") =
            Some(BackendError::transport("matrix_http_error", "connection reset"));
        harness.login().await;
        let first = harness.factory.last_handle();
        assert!(harness.manager.is_degraded().await);

        *harness.factory.start_sync_error.lock().expect("lock") = None;
        harness.set_overlay(true).await;

        let session = harness.manager.reconnect().await.expect("reconnect");
        assert_eq!(session.connection_mode, ConnectionMode::Enhanced);
        assert!(!harness.manager.is_degraded().await);
        assert_eq!(harness.factory.handle_count(), 2);
        assert_eq!(first.base_url(), "https://matrix.org");
        assert_eq!(harness.factory.last_handle().base_url(), BRIDGE_URL);
        assert!(first.calls().contains(&"stop_sync".to_owned()));
    }

    #[tokio::test]
    async fn overlay_flip_does_not_readdress_live_handle() {
        let mut harness = Harness::new(false).await;
        harness.login().await;
        harness.set_overlay(true).await;
        harness.manager.selector().decide().await;

        let handle = harness.manager.protocol_client().await.expect("handle");
        assert_eq!(handle.base_url(), "https://matrix.org");
        assert_eq!(
            harness.manager.connection_mode().await,
            Some(ConnectionMode::Standard)
        );
    }

    #[tokio::test]
    async fn emits_lifecycle_events_in_order() {
        let mut harness = Harness::new(true).await;
        let mut events = harness.manager.subscribe();
        harness.login().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen[0],
            SessionEvent::StateChanged {
                state: SessionState::Authenticating
            }
        );
        assert_eq!(
            seen[1],
            SessionEvent::ModeSelected {
                mode: ConnectionMode::Enhanced,
                base_url: BRIDGE_URL.to_owned()
            }
        );
        assert_eq!(
            seen[2],
            SessionEvent::StateChanged {
                state: SessionState::Authenticated
            }
        );
        assert_eq!(
            seen[3],
            SessionEvent::AuthResult {
                success: true,
                error_code: None
            }
        );
    }

    #[test]
    fn generated_device_ids_are_prefixed() {
        let id = generated_device_id();
        assert!(id.starts_with("MYCO"));
        assert_eq!(id.len(), 14);
    }
}

//! In-crate fakes for the protocol capability and a wired-up manager harness.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, EventHub, LiveEvent, MessageKind, MessageRecord, ProtocolClient,
    ProtocolClientFactory, ROOM_MESSAGE_EVENT_TYPE, RoomFeeds, RoomRecord, Session, SourceFlags,
    TimelineEvent, placeholder_room,
};
use backend_gateway::{GatewayClient, GatewayConfig};
use backend_overlay::{ConnectionModeSelector, OverlayConfig, OverlayMonitor};
use backend_platform::{InMemorySessionStore, SessionStore};
use tokio::sync::{broadcast, mpsc};

use crate::{SessionConfig, SessionDeps, SessionManager, TransportEndpoints};

pub(crate) const BRIDGE_URL: &str = "http://bridge.local:8080";

pub(crate) fn message_event(id: &str, timestamp_ms: u64) -> TimelineEvent {
    TimelineEvent {
        event_id: Some(id.to_owned()),
        event_type: ROOM_MESSAGE_EVENT_TYPE.to_owned(),
        sender: "@bob:example.org".to_owned(),
        body: Some(format!("message {id}")),
        msgtype: Some("m.text".to_owned()),
        timestamp_ms,
    }
}

pub(crate) fn ids(records: &[MessageRecord]) -> Vec<&str> {
    records.iter().map(|record| record.id.as_str()).collect()
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub(crate) struct FakeProtocol {
    base_url: String,
    live: EventHub<LiveEvent>,
    room_feeds: RoomFeeds<TimelineEvent>,
    aliases: Mutex<HashMap<String, String>>,
    timelines: Mutex<HashMap<String, Vec<TimelineEvent>>>,
    joined: Mutex<Vec<RoomRecord>>,
    pub start_sync_error: Mutex<Option<BackendError>>,
    pub join_error: Mutex<Option<BackendError>>,
    pub logout_error: Mutex<Option<BackendError>>,
    pub sync_running: AtomicBool,
    calls: Mutex<Vec<String>>,
    sent: AtomicU64,
}

impl FakeProtocol {
    pub(crate) fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_owned(),
            live: EventHub::new(64),
            room_feeds: RoomFeeds::new(),
            aliases: Mutex::new(HashMap::new()),
            timelines: Mutex::new(HashMap::new()),
            joined: Mutex::new(Vec::new()),
            start_sync_error: Mutex::new(None),
            join_error: Mutex::new(None),
            logout_error: Mutex::new(None),
            sync_running: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit_live(&self, room_id: &str, event: TimelineEvent) {
        self.room_feeds.emit(room_id, &event);
        self.live.emit(LiveEvent {
            room_id: room_id.to_owned(),
            event,
        });
    }

    /// Snapshot served by `fetch_timeline`, newest first.
    pub(crate) fn set_timeline(&self, room_id: &str, newest_first: Vec<TimelineEvent>) {
        self.timelines
            .lock()
            .expect("timelines lock")
            .insert(room_id.to_owned(), newest_first);
    }

    pub(crate) fn set_joined(&self, rooms: Vec<RoomRecord>) {
        *self.joined.lock().expect("joined lock") = rooms;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Open per-room live subscriptions.
    pub(crate) fn live_receivers(&self) -> usize {
        self.room_feeds.subscriber_count()
    }

    /// Make `join_room(alias)` resolve to `room_id`.
    pub(crate) fn set_alias(&self, alias: &str, room_id: &str) {
        self.aliases
            .lock()
            .expect("aliases lock")
            .insert(alias.to_owned(), room_id.to_owned());
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn start_sync(&self) -> Result<(), BackendError> {
        self.record("start_sync");
        if let Some(err) = self.start_sync_error.lock().expect("lock").clone() {
            return Err(err);
        }
        self.sync_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_sync(&self) -> Result<(), BackendError> {
        self.record("stop_sync");
        self.sync_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_live(&self) -> broadcast::Receiver<LiveEvent> {
        self.live.subscribe()
    }

    fn subscribe_room(&self, room_id: &str) -> mpsc::UnboundedReceiver<TimelineEvent> {
        self.room_feeds.subscribe(room_id)
    }

    async fn fetch_timeline(
        &self,
        room_id: &str,
        limit: u16,
    ) -> Result<Vec<TimelineEvent>, BackendError> {
        self.record(format!("fetch_timeline:{room_id}"));
        let mut events = self
            .timelines
            .lock()
            .expect("timelines lock")
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        events.truncate(usize::from(limit));
        Ok(events)
    }

    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<String, BackendError> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let event_id = format!("$sent{n}");
        self.record(format!("send_message:{room_id}"));
        // Remote echo arrives over the live stream.
        self.emit_live(
            room_id,
            TimelineEvent {
                event_id: Some(event_id.clone()),
                event_type: ROOM_MESSAGE_EVENT_TYPE.to_owned(),
                sender: "@alice:example.org".to_owned(),
                body: Some(body.to_owned()),
                msgtype: Some(kind.as_msgtype().to_owned()),
                timestamp_ms: 10_000 + n,
            },
        );
        Ok(event_id)
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError> {
        self.record(format!("join_room:{room_id_or_alias}"));
        if let Some(err) = self.join_error.lock().expect("lock").clone() {
            return Err(err);
        }
        let room_id = self
            .aliases
            .lock()
            .expect("aliases lock")
            .get(room_id_or_alias)
            .cloned()
            .unwrap_or_else(|| room_id_or_alias.to_owned());
        let mut joined = self.joined.lock().expect("joined lock");
        if !joined.iter().any(|room| room.room_id == room_id) {
            joined.push(RoomRecord {
                member_count: 1,
                ..placeholder_room(&room_id, SourceFlags::PROTOCOL)
            });
        }
        Ok(room_id)
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), BackendError> {
        self.record(format!("leave_room:{room_id}"));
        self.joined
            .lock()
            .expect("joined lock")
            .retain(|room| room.room_id != room_id);
        Ok(())
    }

    fn joined_rooms(&self) -> Vec<RoomRecord> {
        self.joined.lock().expect("joined lock").clone()
    }

    async fn logout(&self) -> Result<(), BackendError> {
        self.record("logout");
        match self.logout_error.lock().expect("lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    connects: Mutex<Vec<(String, Session)>>,
    handles: Mutex<Vec<Arc<FakeProtocol>>>,
    pub connect_error: Mutex<Option<BackendError>>,
    pub start_sync_error: Mutex<Option<BackendError>>,
    pub connect_delay: Mutex<Option<Duration>>,
}

impl FakeFactory {
    pub(crate) fn connects(&self) -> Vec<(String, Session)> {
        self.connects.lock().expect("connects lock").clone()
    }

    pub(crate) fn last_handle(&self) -> Arc<FakeProtocol> {
        self.handles
            .lock()
            .expect("handles lock")
            .last()
            .cloned()
            .expect("a handle should have been built")
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.lock().expect("handles lock").len()
    }
}

#[async_trait]
impl ProtocolClientFactory for FakeFactory {
    async fn connect(
        &self,
        base_url: &str,
        session: &Session,
    ) -> Result<Arc<dyn ProtocolClient>, BackendError> {
        let delay = *self.connect_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.connects
            .lock()
            .expect("connects lock")
            .push((base_url.to_owned(), session.clone()));
        if let Some(err) = self.connect_error.lock().expect("lock").clone() {
            return Err(err);
        }

        let handle = Arc::new(FakeProtocol::new(base_url));
        *handle.start_sync_error.lock().expect("lock") =
            self.start_sync_error.lock().expect("lock").clone();
        self.handles
            .lock()
            .expect("handles lock")
            .push(Arc::clone(&handle));
        Ok(handle)
    }
}

pub(crate) struct Harness {
    pub gateway: mockito::ServerGuard,
    pub overlay: mockito::ServerGuard,
    pub factory: Arc<FakeFactory>,
    pub store: InMemorySessionStore,
    pub manager: Arc<SessionManager>,
    overlay_up: Option<mockito::Mock>,
}

impl Harness {
    pub(crate) async fn new(overlay_up: bool) -> Self {
        Self::with_store(overlay_up, InMemorySessionStore::default()).await
    }

    pub(crate) async fn with_store(overlay_up: bool, store: InMemorySessionStore) -> Self {
        let gateway = mockito::Server::new_async().await;
        let overlay = mockito::Server::new_async().await;
        let factory = Arc::new(FakeFactory::default());

        let monitor = OverlayMonitor::new(OverlayConfig {
            base_url: overlay.url(),
            admin_timeout: Duration::from_millis(500),
            peers_timeout: Duration::from_millis(500),
            ..OverlayConfig::default()
        });
        let deps = SessionDeps {
            gateway: GatewayClient::new(GatewayConfig {
                base_url: gateway.url(),
                timeout: Duration::from_secs(2),
            })
            .expect("gateway client"),
            // Zero reuse window so overlay flips show up on the next checkpoint.
            selector: ConnectionModeSelector::with_reuse_window(Arc::new(monitor), Duration::ZERO),
            factory: Arc::clone(&factory) as Arc<dyn ProtocolClientFactory>,
            store: Arc::new(store.clone()) as Arc<dyn SessionStore>,
            endpoints: TransportEndpoints::new(BRIDGE_URL, "https"),
        };
        let manager = Arc::new(SessionManager::new(
            deps,
            SessionConfig {
                protocol_timeout: Duration::from_secs(2),
                ..SessionConfig::default()
            },
        ));

        let mut harness = Self {
            gateway,
            overlay,
            factory,
            store,
            manager,
            overlay_up: None,
        };
        harness.set_overlay(overlay_up).await;
        harness
    }

    /// Flip the overlay daemon; when down, every admin request gets mockito's 501.
    pub(crate) async fn set_overlay(&mut self, up: bool) {
        if let Some(mock) = self.overlay_up.take() {
            mock.remove_async().await;
        }
        if up {
            let mock = self
                .overlay
                .mock("GET", "/api/v1/admin")
                .with_status(200)
                .with_body(r#"{"version":"0.5.7","peers":[{},{}]}"#)
                .create_async()
                .await;
            self.overlay_up = Some(mock);
        }
    }

    pub(crate) async fn mock_login_ok(&mut self) -> mockito::Mock {
        self.gateway
            .mock("POST", "/api/auth/login")
            .with_status(200)
            .with_body(r#"{"success":true,"data":{"access_token":"tok","user_id":"@alice:matrix.org"}}"#)
            .create_async()
            .await
    }

    pub(crate) async fn login(&mut self) -> Session {
        let _login = self.mock_login_ok().await;
        self.manager
            .login("alice", "hunter2", "matrix.org")
            .await
            .expect("login should succeed")
    }
}

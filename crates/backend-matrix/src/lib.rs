use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, BackendErrorCategory, EventHub, LiveEvent, MessageKind, ProtocolClient,
    ProtocolClientFactory, RetryPolicy, RoomFeeds, RoomRecord, Session, SourceFlags, TimelineEvent,
    TimelineBuffer,
};
use matrix_sdk::{
    Client, ClientBuildError, HttpError, Room,
    authentication::matrix::MatrixSession,
    config::{RequestConfig, SyncSettings},
    event_handler::EventHandlerHandle,
    room::MessagesOptions,
    ruma::{
        OwnedRoomId, OwnedRoomOrAliasId, UInt,
        api::client::error::{ErrorKind, RetryAfter},
        events::room::message::{OriginalSyncRoomMessageEvent, RoomMessageEventContent},
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LIVE_EVENT_BUFFER: usize = 256;
const SERVER_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MatrixFactoryConfig {
    /// Root under which one sqlite store per (base URL, user) is kept.
    pub data_root: PathBuf,
    pub store_passphrase: Option<String>,
    /// Upper bound for every protocol call made through a handle.
    pub call_timeout: Duration,
}

impl MatrixFactoryConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            store_passphrase: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Builds matrix-sdk handles from gateway-issued sessions.
#[derive(Debug, Clone)]
pub struct MatrixClientFactory {
    config: MatrixFactoryConfig,
}

impl MatrixClientFactory {
    pub fn new(config: MatrixFactoryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProtocolClientFactory for MatrixClientFactory {
    async fn connect(
        &self,
        base_url: &str,
        session: &Session,
    ) -> Result<Arc<dyn ProtocolClient>, BackendError> {
        let data_dir = store_dir_under(&self.config.data_root, base_url, &session.user_id);
        let call_timeout = self.config.call_timeout;

        let client = Client::builder()
            .homeserver_url(base_url)
            .sqlite_store(&data_dir, self.config.store_passphrase.as_deref())
            .request_config(RequestConfig::new().timeout(call_timeout))
            .build()
            .await
            .map_err(map_client_build_error)?;

        bounded("restore session", call_timeout, async {
            client
                .restore_session(matrix_session(session)?)
                .await
                .map_err(map_matrix_error)
        })
        .await?;

        info!(
            base_url,
            data_dir = %data_dir.display(),
            "protocol handle constructed"
        );
        Ok(Arc::new(MatrixProtocolClient::new(client, base_url, call_timeout)))
    }
}

#[derive(Debug)]
struct RunningSyncTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
    handler: EventHandlerHandle,
}

/// One matrix-sdk client bound to a fixed homeserver (or bridge) address.
#[derive(Debug)]
pub struct MatrixProtocolClient {
    client: Client,
    base_url: String,
    live: EventHub<LiveEvent>,
    room_feeds: Arc<RoomFeeds<TimelineEvent>>,
    sync_task: Mutex<Option<RunningSyncTask>>,
    call_timeout: Duration,
}

impl MatrixProtocolClient {
    pub fn new(client: Client, base_url: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            live: EventHub::new(LIVE_EVENT_BUFFER),
            room_feeds: Arc::new(RoomFeeds::new()),
            sync_task: Mutex::new(None),
            call_timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn lookup_room(&self, room_id: &str) -> Result<Room, BackendError> {
        let room_id = parse_room_id(room_id)?;
        self.client.get_room(&room_id).ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Config,
                "room_not_found",
                format!("room not found: {room_id}"),
            )
        })
    }
}

#[async_trait]
impl ProtocolClient for MatrixProtocolClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn start_sync(&self) -> Result<(), BackendError> {
        let mut guard = self.sync_task.lock().await;
        if guard.is_some() {
            return Err(BackendError::new(
                BackendErrorCategory::Internal,
                "sync_already_running",
                "sync task is already running",
            ));
        }

        // The first sync proves the token is usable before the loop goes quiet.
        let initial = bounded("initial sync", self.call_timeout, async {
            self.client
                .sync_once(SyncSettings::default())
                .await
                .map_err(map_matrix_error)
        })
        .await?;

        let live = self.live.clone();
        let room_feeds = Arc::clone(&self.room_feeds);
        let handler = self.client.add_event_handler(
            move |event: OriginalSyncRoomMessageEvent, room: Room| {
                let live = live.clone();
                let room_feeds = Arc::clone(&room_feeds);
                async move {
                    let room_id = room.room_id().to_string();
                    let event = timeline_event_from_sync_message(&event);
                    room_feeds.emit(&room_id, &event);
                    live.emit(LiveEvent { room_id, event });
                }
            },
        );

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let client = self.client.clone();
        let mut sync_settings = SyncSettings::default().token(initial.next_batch);
        let task = tokio::spawn(async move {
            let retry_policy = RetryPolicy::default();
            let mut attempt: u32 = 0;

            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    sync_result = client.sync_once(sync_settings.clone()) => {
                        match sync_result {
                            Ok(sync_response) => {
                                attempt = 0;
                                sync_settings = sync_settings.token(sync_response.next_batch);
                            }
                            Err(err) => {
                                let mapped = map_matrix_error(err);
                                if !is_recoverable_sync_error(&mapped) {
                                    warn!(code = %mapped.code, error = %mapped.message, "live sync stopped");
                                    break;
                                }

                                let delay = retry_policy.delay_for_attempt(attempt, mapped.retry_after_ms);
                                attempt = attempt.saturating_add(1);
                                debug!(
                                    code = %mapped.code,
                                    delay_ms = delay.as_millis() as u64,
                                    "live sync failed, retrying"
                                );

                                tokio::select! {
                                    _ = stop_child.cancelled() => break,
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                        }
                    }
                }
            }
            debug!("live sync loop exited");
        });

        *guard = Some(RunningSyncTask {
            stop,
            task,
            handler,
        });
        Ok(())
    }

    async fn stop_sync(&self) -> Result<(), BackendError> {
        let running = {
            let mut guard = self.sync_task.lock().await;
            guard.take()
        };

        let Some(running) = running else {
            return Ok(());
        };

        running.stop.cancel();
        let _ = running.task.await;
        self.client.remove_event_handler(running.handler);
        Ok(())
    }

    fn subscribe_live(&self) -> tokio::sync::broadcast::Receiver<LiveEvent> {
        self.live.subscribe()
    }

    fn subscribe_room(
        &self,
        room_id: &str,
    ) -> tokio::sync::mpsc::UnboundedReceiver<TimelineEvent> {
        self.room_feeds.subscribe(room_id)
    }

    async fn fetch_timeline(
        &self,
        room_id: &str,
        limit: u16,
    ) -> Result<Vec<TimelineEvent>, BackendError> {
        let room = self.lookup_room(room_id)?;
        let limit = TimelineBuffer::bounded_fetch_limit(limit, SERVER_PAGINATION_LIMIT_CAP);
        let messages = bounded("fetch timeline", self.call_timeout, async {
            room.messages(messages_options(limit)?)
                .await
                .map_err(map_matrix_error)
        })
        .await?;

        // Backward pagination yields newest first; that order is preserved.
        Ok(messages
            .chunk
            .iter()
            .filter_map(timeline_event_from_sdk)
            .collect())
    }

    async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<String, BackendError> {
        let room = self.lookup_room(room_id)?;

        let content = match kind {
            MessageKind::Text => RoomMessageEventContent::text_plain(body),
            MessageKind::Notice => RoomMessageEventContent::notice_plain(body),
            MessageKind::Emote => RoomMessageEventContent::emote_plain(body),
            MessageKind::Other(msgtype) => {
                return Err(BackendError::new(
                    BackendErrorCategory::Config,
                    "unsupported_msgtype",
                    format!("cannot send messages of type '{msgtype}'"),
                ));
            }
        };

        let response = bounded("send message", self.call_timeout, async {
            room.send(content).await.map_err(map_matrix_error)
        })
        .await?;
        Ok(response.event_id.to_string())
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError> {
        let target = parse_room_or_alias_id(room_id_or_alias)?;
        let room = bounded("join room", self.call_timeout, async {
            self.client
                .join_room_by_id_or_alias(&target, &[])
                .await
                .map_err(map_matrix_error)
        })
        .await?;
        Ok(room.room_id().to_string())
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), BackendError> {
        let room = self.lookup_room(room_id)?;
        bounded("leave room", self.call_timeout, async {
            room.leave().await.map_err(map_matrix_error)
        })
        .await
    }

    fn joined_rooms(&self) -> Vec<RoomRecord> {
        let mut rooms: Vec<RoomRecord> = self
            .client
            .joined_rooms()
            .into_iter()
            .map(|room| {
                let room_id = room.room_id().to_string();
                RoomRecord {
                    display_name: room.name().unwrap_or_else(|| room_id.clone()),
                    topic: room.topic(),
                    member_count: room.joined_members_count(),
                    source: SourceFlags::PROTOCOL,
                    room_id,
                }
            })
            .collect();

        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    async fn logout(&self) -> Result<(), BackendError> {
        bounded("logout", self.call_timeout, async {
            self.client.logout().await.map_err(map_matrix_error)
        })
        .await
    }
}

async fn bounded<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BackendError::timeout(operation, limit))?
}

fn matrix_session(session: &Session) -> Result<MatrixSession, BackendError> {
    let value = serde_json::json!({
        "user_id": session.user_id,
        "device_id": session.device_id,
        "access_token": session.access_token,
    });
    serde_json::from_value(value).map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_session",
            format!("session for '{}' cannot be restored: {err}", session.user_id),
        )
    })
}

/// Per-(address, user) sqlite store directory.
///
/// Enhanced and standard handles for one user never share a store.
pub fn store_dir_under(data_root: &Path, base_url: &str, user_id: &str) -> PathBuf {
    let homeserver_slug = slugify_component(base_url, 64);
    let user_slug = slugify_component(user_id, 64);
    data_root
        .join(format!("hs-{homeserver_slug}"))
        .join(format!("user-{user_slug}"))
}

fn slugify_component(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut last_was_sep = false;
    for ch in input.chars() {
        let next = if ch.is_ascii_alphanumeric() {
            ch.to_ascii_lowercase()
        } else {
            '_'
        };

        if next == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }

        out.push(next);
        if out.len() >= max_len {
            break;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn parse_room_id(value: &str) -> Result<OwnedRoomId, BackendError> {
    value.parse::<OwnedRoomId>().map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_room_id",
            format!("invalid room id '{value}': {err}"),
        )
    })
}

fn parse_room_or_alias_id(value: &str) -> Result<OwnedRoomOrAliasId, BackendError> {
    value.parse::<OwnedRoomOrAliasId>().map_err(|err| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_room_id_or_alias",
            format!("invalid room id or alias '{value}': {err}"),
        )
    })
}

fn messages_options(limit: u16) -> Result<MessagesOptions, BackendError> {
    let mut options = MessagesOptions::backward();
    options.limit = UInt::new(u64::from(limit)).ok_or_else(|| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_pagination_limit",
            format!("invalid pagination limit: {limit}"),
        )
    })?;
    Ok(options)
}

fn timeline_event_from_sdk(
    event: &matrix_sdk::deserialized_responses::TimelineEvent,
) -> Option<TimelineEvent> {
    let value = event.raw().deserialize_as::<serde_json::Value>().ok()?;
    let mut mapped = timeline_event_from_json(&value)?;
    if mapped.event_id.is_none() {
        mapped.event_id = event.event_id().map(|event_id| event_id.to_string());
    }
    Some(mapped)
}

/// Map a client-server API event object; events without sender or type are skipped.
fn timeline_event_from_json(value: &serde_json::Value) -> Option<TimelineEvent> {
    let event_type = value.get("type")?.as_str()?.to_owned();
    let sender = value.get("sender")?.as_str()?.to_owned();
    let content = value.get("content");
    let content_str = |field: &str| {
        content
            .and_then(|content| content.get(field))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
    };

    Some(TimelineEvent {
        event_id: value
            .get("event_id")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned),
        event_type,
        sender,
        body: content_str("body"),
        msgtype: content_str("msgtype"),
        timestamp_ms: value
            .get("origin_server_ts")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0),
    })
}

fn timeline_event_from_sync_message(event: &OriginalSyncRoomMessageEvent) -> TimelineEvent {
    TimelineEvent {
        event_id: Some(event.event_id.to_string()),
        event_type: backend_core::ROOM_MESSAGE_EVENT_TYPE.to_owned(),
        sender: event.sender.to_string(),
        body: Some(event.content.body().to_owned()),
        msgtype: Some(event.content.msgtype().to_owned()),
        timestamp_ms: u64::from(event.origin_server_ts.get()),
    }
}

fn is_recoverable_sync_error(err: &BackendError) -> bool {
    matches!(
        err.category,
        BackendErrorCategory::Network | BackendErrorCategory::RateLimited
    )
}

fn map_matrix_http_error(err: HttpError) -> BackendError {
    if let Some(client_err) = err.as_client_api_error() {
        let status = client_err.status_code.as_u16();
        let mut mapped =
            BackendError::from_http_status(status, "matrix_http_error", client_err.to_string());

        if let Some(ErrorKind::LimitExceeded { retry_after }) = client_err.error_kind()
            && let Some(RetryAfter::Delay(delay)) = retry_after
        {
            mapped = mapped.with_retry_after(*delay);
        }

        mapped
    } else {
        BackendError::transport("matrix_http_error", err.to_string())
    }
}

fn map_matrix_error(err: matrix_sdk::Error) -> BackendError {
    use matrix_sdk::Error;

    match err {
        Error::Http(http_err) => map_matrix_http_error(*http_err),
        Error::AuthenticationRequired => {
            BackendError::new(BackendErrorCategory::Auth, "auth_required", err.to_string())
        }
        Error::StateStore(_) | Error::EventCacheStore(_) | Error::Io(_) => {
            BackendError::new(
                BackendErrorCategory::Storage,
                "storage_error",
                err.to_string(),
            )
        }
        Error::SerdeJson(_) => BackendError::new(
            BackendErrorCategory::Serialization,
            "serde_json_error",
            err.to_string(),
        ),
        _ => BackendError::new(
            BackendErrorCategory::Internal,
            "matrix_error",
            err.to_string(),
        ),
    }
}

fn map_client_build_error(err: ClientBuildError) -> BackendError {
    BackendError::new(
        BackendErrorCategory::Config,
        "client_build_error",
        err.to_string(),
    )
}

//! Typed client for the REST gateway that owns auth and room records.
//!
//! Every operation returns `Result<_, GatewayError>`; expected failures
//! (bad credentials, room exists, gateway down) never panic or hang.

use std::time::Duration;

use backend_core::{BackendError, BackendErrorCategory, RoomRecord, SourceFlags};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080";
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GATEWAY_URL.to_owned(),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }
}

/// Gateway failure: an HTTP status with the server's message, or a transport marker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid gateway base url '{0}'")]
    InvalidBaseUrl(String),
    #[error("gateway returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// A 2xx response whose envelope reported `success: false`.
    #[error("gateway rejected the request: {message}")]
    Rejected { status: u16, message: String },
    #[error("gateway unreachable: {message}")]
    Network { message: String, timed_out: bool },
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Http { status: 409, .. })
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

impl From<GatewayError> for BackendError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidBaseUrl(url) => BackendError::new(
                BackendErrorCategory::Config,
                "gateway_invalid_url",
                format!("invalid gateway base url '{url}'"),
            ),
            GatewayError::Http { status, message } => {
                BackendError::from_http_status(status, "gateway_http_error", message)
            }
            GatewayError::Rejected { status, message } => {
                let mut err =
                    BackendError::new(BackendErrorCategory::Config, "gateway_rejected", message);
                err.http_status = Some(status);
                err
            }
            GatewayError::Network {
                message,
                timed_out: true,
            } => BackendError::transport("timeout", message),
            GatewayError::Network { message, .. } => {
                BackendError::transport("gateway_unreachable", message)
            }
            GatewayError::Decode(message) => BackendError::new(
                BackendErrorCategory::Serialization,
                "gateway_decode_error",
                message,
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateRoomRequest {
    pub room_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

impl CreateRoomRequest {
    pub fn named(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedRoom {
    pub room_id: String,
    pub room_name: String,
}

impl CreatedRoom {
    pub fn to_record(&self, topic: Option<String>) -> RoomRecord {
        RoomRecord {
            room_id: self.room_id.clone(),
            display_name: self.room_name.clone(),
            topic,
            member_count: 1,
            source: SourceFlags::GATEWAY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct JoinRoomRequest<'a> {
    room_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinedRoom {
    pub room_id: String,
    #[serde(default = "default_joined")]
    pub joined: bool,
}

fn default_joined() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayRoom {
    pub room_id: String,
    pub room_name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub member_count: u64,
}

impl From<GatewayRoom> for RoomRecord {
    fn from(room: GatewayRoom) -> Self {
        RoomRecord {
            room_id: room.room_id,
            display_name: room.room_name,
            topic: room.topic,
            member_count: room.member_count,
            source: SourceFlags::GATEWAY,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoomList {
    #[serde(default)]
    rooms: Vec<GatewayRoom>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base: Url,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let base = Url::parse(&config.base_url)
            .map_err(|_| GatewayError::InvalidBaseUrl(config.base_url.clone()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidBaseUrl(config.base_url));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(GatewayError::from_reqwest)?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse, GatewayError> {
        let request = self
            .http
            .post(self.endpoint(&["api", "auth", "login"]))
            .json(&LoginRequest { username, password });
        self.send_expecting(request, "login").await
    }

    pub async fn logout(&self, access_token: Option<&str>) -> Result<(), GatewayError> {
        let request = self
            .with_auth(self.http.post(self.endpoint(&["api", "auth", "logout"])), access_token);
        self.send_unit(request, "logout").await
    }

    pub async fn create_room(
        &self,
        access_token: Option<&str>,
        room: &CreateRoomRequest,
    ) -> Result<CreatedRoom, GatewayError> {
        let request = self.with_auth(
            self.http
                .post(self.endpoint(&["api", "rooms", "create"]))
                .json(room),
            access_token,
        );
        self.send_expecting(request, "create_room").await
    }

    pub async fn join_room(
        &self,
        access_token: Option<&str>,
        room_id: &str,
    ) -> Result<JoinedRoom, GatewayError> {
        let request = self.with_auth(
            self.http
                .post(self.endpoint(&["api", "rooms", "join", room_id]))
                .json(&JoinRoomRequest { room_id }),
            access_token,
        );
        self.send_expecting(request, "join_room").await
    }

    pub async fn list_rooms(
        &self,
        access_token: Option<&str>,
    ) -> Result<Vec<GatewayRoom>, GatewayError> {
        let request = self.with_auth(
            self.http.get(self.endpoint(&["api", "rooms", "list"])),
            access_token,
        );
        let list: RoomList = self.send_expecting(request, "list_rooms").await?;
        Ok(list.rooms)
    }

    /// `GET /` liveness probe; any non-2xx or transport failure is `false`.
    pub async fn health_check(&self) -> bool {
        match self.http.get(self.base.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "gateway health check failed");
                false
            }
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn with_auth(
        &self,
        request: reqwest::RequestBuilder,
        access_token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_expecting<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, GatewayError> {
        let envelope = self.send_envelope::<T>(request, operation).await?;
        envelope
            .data
            .ok_or_else(|| GatewayError::Decode(format!("{operation}: response carried no data")))
    }

    async fn send_unit(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<(), GatewayError> {
        self.send_envelope::<serde_json::Value>(request, operation)
            .await
            .map(|_| ())
    }

    async fn send_envelope<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<Envelope<T>, GatewayError> {
        let response = request.send().await.map_err(|err| {
            warn!(operation, error = %err, "gateway request failed");
            GatewayError::from_reqwest(err)
        })?;
        let status = response.status();
        let body = response.bytes().await.map_err(GatewayError::from_reqwest)?;

        if !status.is_success() {
            let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.error)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            debug!(operation, status = status.as_u16(), "gateway rejected request");
            return Err(GatewayError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let envelope = if body.is_empty() {
            Envelope {
                success: None,
                data: None,
                error: None,
            }
        } else {
            serde_json::from_slice::<Envelope<T>>(&body)
                .map_err(|err| GatewayError::Decode(format!("{operation}: {err}")))?
        };

        if envelope.success == Some(false) {
            debug!(operation, status = status.as_u16(), "gateway envelope reported failure");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: envelope
                    .error
                    .unwrap_or_else(|| format!("{operation} rejected by gateway")),
            });
        }
        Ok(envelope)
    }
}

//! Environment-backed runtime configuration for `mycochat-headless`.

use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use backend_gateway::{DEFAULT_GATEWAY_URL, GatewayConfig};
use backend_overlay::{DEFAULT_OVERLAY_URL, DEFAULT_PEERS_TIMEOUT, OverlayConfig};
use backend_session::{
    DEFAULT_BRIDGE_URL, DEFAULT_ORIGIN_SCHEME, SessionConfig, TimelineConfig, TransportEndpoints,
};

const DEFAULT_DATA_DIR: &str = "./.mycochat-store";
const SESSION_RECORD_FILENAME: &str = "session.json";
const DEFAULT_SERVER_NAME: &str = "matrix.org";
const DEFAULT_OVERLAY_POLL_INTERVAL_MS: u64 = 30_000;
const DEFAULT_OVERLAY_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROTOCOL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TIMELINE_LIMIT: u16 = 30;
const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_200;

/// Runtime configuration for the headless client.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessConfig {
    pub gateway_url: String,
    pub overlay_url: String,
    /// Protocol address used in enhanced mode.
    pub bridge_url: String,
    /// Scheme prefixed to a bare server name in standard mode.
    pub origin_scheme: String,
    pub data_dir: PathBuf,
    /// Where the session record is persisted.
    pub session_store: SessionStoreKind,
    pub overlay_poll_interval: Duration,
    pub overlay_timeout: Duration,
    pub gateway_timeout: Duration,
    pub protocol_timeout: Duration,
    pub timeline_limit: u16,
    pub timeline_max_items: usize,
    /// Credentials for a fresh login when no session record restores.
    pub credentials: Option<Credentials>,
    pub server_name: String,
    /// Room to tail after startup.
    pub room: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreKind {
    /// `<data_dir>/session.json`
    File,
    /// OS keyring; needs the `os-keyring` feature.
    Keyring,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl HeadlessConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let gateway_url = optional_trimmed_env("MYCOCHAT_GATEWAY_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_owned());
        let overlay_url = optional_trimmed_env("MYCOCHAT_OVERLAY_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_OVERLAY_URL.to_owned());
        let bridge_url = optional_trimmed_env("MYCOCHAT_BRIDGE_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_owned());
        let origin_scheme = optional_trimmed_env("MYCOCHAT_ORIGIN_SCHEME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ORIGIN_SCHEME.to_owned());
        if !matches!(origin_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "MYCOCHAT_ORIGIN_SCHEME",
                value: origin_scheme,
                reason: "must be http or https".to_owned(),
            });
        }
        let data_dir = optional_trimmed_env("MYCOCHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let session_store = match optional_trimmed_env("MYCOCHAT_SESSION_STORE", &mut lookup)
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("file") => SessionStoreKind::File,
            Some("keyring") => SessionStoreKind::Keyring,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "MYCOCHAT_SESSION_STORE",
                    value: other.to_owned(),
                    reason: "must be file or keyring".to_owned(),
                });
            }
        };

        let overlay_poll_interval = parse_positive_millis(
            "MYCOCHAT_OVERLAY_POLL_INTERVAL_MS",
            DEFAULT_OVERLAY_POLL_INTERVAL_MS,
            &mut lookup,
        )?;
        let overlay_timeout = parse_positive_millis(
            "MYCOCHAT_OVERLAY_TIMEOUT_MS",
            DEFAULT_OVERLAY_TIMEOUT_MS,
            &mut lookup,
        )?;
        let gateway_timeout = parse_positive_millis(
            "MYCOCHAT_GATEWAY_TIMEOUT_MS",
            DEFAULT_GATEWAY_TIMEOUT_MS,
            &mut lookup,
        )?;
        let protocol_timeout = parse_positive_millis(
            "MYCOCHAT_PROTOCOL_TIMEOUT_MS",
            DEFAULT_PROTOCOL_TIMEOUT_MS,
            &mut lookup,
        )?;

        let timeline_limit = parse_optional_u16("MYCOCHAT_TIMELINE_LIMIT", &mut lookup)?
            .unwrap_or(DEFAULT_TIMELINE_LIMIT);
        if timeline_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MYCOCHAT_TIMELINE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let timeline_max_items = parse_optional_usize(
            "MYCOCHAT_TIMELINE_MAX_ITEMS",
            DEFAULT_TIMELINE_MAX_ITEMS,
            &mut lookup,
        )?;
        if timeline_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MYCOCHAT_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let username = optional_trimmed_env("MYCOCHAT_USER", &mut lookup);
        // Passwords are taken verbatim.
        let password = lookup("MYCOCHAT_PASSWORD").filter(|value| !value.is_empty());
        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };
        let server_name = optional_trimmed_env("MYCOCHAT_SERVER_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_owned());
        let room = optional_trimmed_env("MYCOCHAT_ROOM", &mut lookup);

        Ok(Self {
            gateway_url,
            overlay_url,
            bridge_url,
            origin_scheme,
            data_dir,
            session_store,
            overlay_poll_interval,
            overlay_timeout,
            gateway_timeout,
            protocol_timeout,
            timeline_limit,
            timeline_max_items,
            credentials,
            server_name,
            room,
        })
    }

    /// Location of the persisted session record.
    pub fn session_record_path(&self) -> PathBuf {
        session_record_path_under(&self.data_dir)
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway_url.clone(),
            timeout: self.gateway_timeout,
        }
    }

    pub fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            base_url: self.overlay_url.clone(),
            admin_timeout: self.overlay_timeout,
            peers_timeout: self.overlay_timeout.max(DEFAULT_PEERS_TIMEOUT),
            poll_interval: self.overlay_poll_interval,
        }
    }

    pub fn endpoints(&self) -> TransportEndpoints {
        TransportEndpoints::new(self.bridge_url.clone(), self.origin_scheme.clone())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            protocol_timeout: self.protocol_timeout,
            ..SessionConfig::default()
        }
    }

    pub fn timeline(&self) -> TimelineConfig {
        TimelineConfig {
            fetch_limit: self.timeline_limit,
            max_items: self.timeline_max_items,
            call_timeout: self.protocol_timeout,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn session_record_path_under(data_dir: &Path) -> PathBuf {
    data_dir.join(SESSION_RECORD_FILENAME)
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_positive_millis<F>(
    key: &'static str,
    default_ms: u64,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(Duration::from_millis(default_ms));
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be at least 1".to_owned(),
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(err) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        }),
    }
}

//! Durable storage for the single persisted session record.
//!
//! The record is always written whole: readers observe either the previous
//! record or the new one, never a mix.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use backend_core::{BackendError, BackendErrorCategory, Session};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Version written into every persisted record.
pub const SESSION_RECORD_VERSION: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("persisted session record is corrupt: {0}")]
    Corrupt(String),
    #[error("persisted session record has unsupported version {0}")]
    UnsupportedVersion(u32),
}

impl StoreError {
    /// The stored blob exists but cannot be used; callers should clear it.
    pub fn is_stale_record(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::UnsupportedVersion(_))
    }
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        let (category, code) = match &err {
            StoreError::Unavailable(_) => (BackendErrorCategory::Storage, "session_store_unavailable"),
            StoreError::Backend(_) => (BackendErrorCategory::Storage, "session_store_error"),
            StoreError::Corrupt(_) => (BackendErrorCategory::Serialization, "session_record_corrupt"),
            StoreError::UnsupportedVersion(_) => {
                (BackendErrorCategory::Serialization, "session_record_unsupported")
            }
        };
        BackendError::new(category, code, err.to_string())
    }
}

/// Persistence for the one session record.
pub trait SessionStore: Send + Sync {
    /// Read the record; `Ok(None)` when nothing is stored.
    fn load(&self) -> Result<Option<Session>, StoreError>;

    /// Replace the whole record.
    fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove the record. Clearing an absent record succeeds.
    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionProbe {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    session: Session,
}

/// Encode a session as a versioned record blob.
pub fn encode_session(session: &Session) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(&SessionRecord {
        version: SESSION_RECORD_VERSION,
        session: session.clone(),
    })
    .map_err(|err| StoreError::Backend(format!("failed encoding session record: {err}")))
}

/// Decode a versioned record blob.
pub fn decode_session(raw: &[u8]) -> Result<Session, StoreError> {
    let probe = serde_json::from_slice::<VersionProbe>(raw)
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;
    if probe.version != SESSION_RECORD_VERSION {
        return Err(StoreError::UnsupportedVersion(probe.version));
    }
    serde_json::from_slice::<SessionRecord>(raw)
        .map(|record| record.session)
        .map_err(|err| StoreError::Corrupt(err.to_string()))
}

/// JSON file store that replaces the record via write-to-temp + rename.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("session.json");
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        parent.join(format!(".{file_name}.{now_nanos}.tmp"))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "failed reading session record {}: {err}",
                    self.path.display()
                )));
            }
        };
        decode_session(&raw).map(Some)
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!(
                    "failed creating session directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded = encode_session(session)?;
        let temp_path = self.temp_path();
        fs::write(&temp_path, encoded).map_err(|err| {
            StoreError::Backend(format!(
                "failed writing temp session record {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StoreError::Backend(format!(
                        "failed replacing session record {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StoreError::Backend(format!(
                    "failed moving session record into {}: {err}",
                    self.path.display()
                ))
            })?;
        }

        debug!(path = %self.path.display(), "session record saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(format!(
                "failed deleting session record {}: {err}",
                self.path.display()
            ))),
        }
    }
}

/// Process-local store; holds the encoded blob so it round-trips like disk.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    blob: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemorySessionStore {
    /// Seed the store with a raw blob (for example a record from an older build).
    pub fn with_raw(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Arc::new(RwLock::new(Some(raw.into()))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blob.read().map(|blob| blob.is_none()).unwrap_or(true)
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        let blob = self
            .blob
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        blob.as_deref().map(decode_session).transpose()
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let encoded = encode_session(session)?;
        let mut blob = self
            .blob
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        *blob = Some(encoded);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut blob = self
            .blob
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        *blob = None;
        Ok(())
    }
}

/// OS keyring entry holding the encoded record under a fixed account key.
#[cfg(feature = "os-keyring")]
#[derive(Debug)]
pub struct KeyringSessionStore {
    entry: keyring::Entry,
}

#[cfg(feature = "os-keyring")]
impl KeyringSessionStore {
    pub fn new(service: &str, account: &str) -> Result<Self, StoreError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { entry })
    }
}

#[cfg(feature = "os-keyring")]
impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        match self.entry.get_password() {
            Ok(raw) => decode_session(raw.as_bytes()).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::NoStorageAccess(err)) => {
                Err(StoreError::Unavailable(err.to_string()))
            }
            Err(other) => Err(StoreError::Backend(other.to_string())),
        }
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let encoded = String::from_utf8(encode_session(session)?)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.entry
            .set_password(&encoded)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        debug!(bytes = encoded.len(), "session record saved to keyring");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(other) => Err(StoreError::Backend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend_core::ConnectionMode;

    fn session() -> Session {
        Session {
            user_id: "@alice:example.org".to_owned(),
            access_token: "syt_token".to_owned(),
            device_id: "DEVICE1".to_owned(),
            server_name: "example.org".to_owned(),
            connection_mode: ConnectionMode::Enhanced,
        }
    }

    #[test]
    fn file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));

        assert_eq!(store.load().expect("empty load"), None);
        store.save(&session()).expect("save should work");
        assert_eq!(store.load().expect("load"), Some(session()));

        store.clear().expect("clear should work");
        assert_eq!(store.load().expect("load after clear"), None);
        store.clear().expect("clearing twice is fine");
    }

    #[test]
    fn file_store_replaces_whole_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileSessionStore::new(dir.path().join("session.json"));

        store.save(&session()).expect("first save");
        let replacement = Session {
            user_id: "@bob:example.org".to_owned(),
            connection_mode: ConnectionMode::Standard,
            ..session()
        };
        store.save(&replacement).expect("second save");

        assert_eq!(store.load().expect("load"), Some(replacement));
        let leftovers = fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn records_are_versioned() {
        let encoded = encode_session(&session()).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(value["version"], SESSION_RECORD_VERSION);
        assert_eq!(value["session"]["connection_mode"], "enhanced");
    }

    #[test]
    fn unknown_versions_and_garbage_are_stale() {
        let future = InMemorySessionStore::with_raw(
            r#"{"version":99,"session":{"whatever":true}}"#.as_bytes(),
        );
        let err = future.load().expect_err("future version must fail");
        assert_eq!(err, StoreError::UnsupportedVersion(99));
        assert!(err.is_stale_record());

        let garbage = InMemorySessionStore::with_raw(b"not json".to_vec());
        let err = garbage.load().expect_err("garbage must fail");
        assert!(err.is_stale_record());
    }

    #[test]
    fn in_memory_store_round_trip() {
        let store = InMemorySessionStore::default();
        assert!(store.is_empty());
        store.save(&session()).expect("save");
        assert_eq!(store.load().expect("load"), Some(session()));
        store.clear().expect("clear");
        assert!(store.is_empty());
    }

    #[test]
    fn store_errors_map_to_backend_categories() {
        let err: BackendError = StoreError::Unavailable("disk gone".to_owned()).into();
        assert_eq!(err.category, BackendErrorCategory::Storage);
        let err: BackendError = StoreError::UnsupportedVersion(3).into();
        assert_eq!(err.code, "session_record_unsupported");
    }

    #[cfg(feature = "os-keyring")]
    #[test]
    fn keyring_store_round_trip_and_clear() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let store = KeyringSessionStore::new("mycochat-test", "session").expect("mock entry");

        assert_eq!(store.load().expect("empty load"), None);
        store.save(&session()).expect("save");
        assert_eq!(store.load().expect("load"), Some(session()));
        store.clear().expect("clear");
        assert_eq!(store.load().expect("load after clear"), None);
        store.clear().expect("clearing twice is fine");
    }
}

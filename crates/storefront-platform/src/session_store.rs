//! Durable persistence of the authenticated session.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use storefront_core::Session;
use thiserror::Error;
use tracing::debug;

/// Service name under which sessions are kept in the OS credential store.
pub const KEYRING_SERVICE: &str = "storefront-session";

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("credential store error during {operation}: {message}")]
    Keyring {
        operation: &'static str,
        message: String,
    },
    #[error("session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session store lock poisoned")]
    Poisoned,
}

/// Storage for the single persisted session.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>, SessionStoreError>;

    fn save(&self, session: &Session) -> Result<(), SessionStoreError>;

    /// Remove persisted state. Clearing an empty store succeeds.
    fn clear(&self) -> Result<(), SessionStoreError>;
}

/// Keeps the session in process memory only.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    session: Arc<RwLock<Option<Session>>>,
}

impl SessionStore for InMemorySessionStore {
    fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        let guard = self
            .session
            .read()
            .map_err(|_| SessionStoreError::Poisoned)?;
        Ok(guard.clone())
    }

    fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| SessionStoreError::Poisoned)?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        let mut guard = self
            .session
            .write()
            .map_err(|_| SessionStoreError::Poisoned)?;
        *guard = None;
        Ok(())
    }
}

/// Credential-store account of the session issued by `api_url`. Scheme,
/// host and port are case-folded and a trailing slash is dropped, so
/// spellings of the same deployment share one entry.
pub fn session_account(api_url: &str) -> String {
    let trimmed = api_url.trim().trim_end_matches('/');
    let (origin, path) = match trimmed.find("://") {
        Some(scheme_end) => {
            let authority_end = trimmed[scheme_end + 3..]
                .find('/')
                .map_or(trimmed.len(), |offset| scheme_end + 3 + offset);
            trimmed.split_at(authority_end)
        }
        None => (trimmed, ""),
    };
    format!("session:{}{path}", origin.to_ascii_lowercase())
}

/// Keeps the session in the OS credential store, one entry per API base URL.
#[cfg(feature = "os-keyring")]
pub struct KeyringSessionStore {
    entry: keyring::Entry,
    account: String,
}

#[cfg(feature = "os-keyring")]
impl KeyringSessionStore {
    pub fn for_api(api_url: &str) -> Result<Self, SessionStoreError> {
        let account = session_account(api_url);
        let entry = keyring::Entry::new(KEYRING_SERVICE, &account)
            .map_err(|err| keyring_error("open_entry", &err))?;
        Ok(Self { entry, account })
    }

    pub fn account(&self) -> &str {
        &self.account
    }
}

#[cfg(feature = "os-keyring")]
impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        match self.entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str::<Session>(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(keyring_error("load_session", &err)),
        }
    }

    fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        let encoded = serde_json::to_string(session)?;
        self.entry
            .set_password(&encoded)
            .map_err(|err| keyring_error("save_session", &err))?;
        debug!(account = %self.account, "session persisted to credential store");
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(keyring_error("clear_session", &err)),
        }
    }
}

#[cfg(feature = "os-keyring")]
fn keyring_error(operation: &'static str, err: &keyring::Error) -> SessionStoreError {
    SessionStoreError::Keyring {
        operation,
        message: err.to_string(),
    }
}

/// Stores the session as a JSON file, replaced atomically on save.
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
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        Ok(Some(serde_json::from_str::<Session>(&raw)?))
    }

    fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
        }

        let encoded = serde_json::to_vec(session)?;
        let temp_path = session_temp_path(&self.path);
        fs::write(&temp_path, encoded).map_err(|err| io_error(&temp_path, err))?;

        if fs::rename(&temp_path, &self.path).is_err() {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(io_error(&self.path, err));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                io_error(&self.path, err)
            })?;
        }

        debug!(path = %self.path.display(), "session persisted");
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path, err)),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SessionStoreError {
    SessionStoreError::Io {
        path: path.to_owned(),
        source,
    }
}

fn session_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("session.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

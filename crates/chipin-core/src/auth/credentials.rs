use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, CredentialBackend};
use crate::error::StorageError;

const SERVICE_NAME: &str = "chipin";

/// Keychain account under which the token pair is stored
const KEYRING_ACCOUNT: &str = "session";

/// Credential file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Access and refresh token pair.
///
/// Persisted as one document with the keys `accessToken` and
/// `refreshToken` so both fields are always written together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }
}

// Tokens never reach logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Durable storage for the token pair.
///
/// `save` replaces both tokens at once; a reader never sees a new access
/// token next to a stale refresh token. Write failures are returned, never
/// swallowed.
pub trait CredentialStore: Send + Sync {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError>;

    /// Last saved credentials, or `None` if nothing is stored.
    fn load(&self) -> Result<Option<Credentials>, StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

/// Open the store selected by the configuration.
pub fn open(config: &Config) -> Result<Arc<dyn CredentialStore>, StorageError> {
    match config.credential_backend {
        CredentialBackend::Keyring => Ok(Arc::new(KeyringCredentialStore::new(
            SERVICE_NAME,
            KEYRING_ACCOUNT,
        ))),
        CredentialBackend::File => {
            let dir = config
                .data_dir()
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            Ok(Arc::new(FileCredentialStore::new(dir.join(CREDENTIALS_FILE))))
        }
    }
}

// ============================================================================
// OS keychain
// ============================================================================

/// Stores the token pair in the OS keychain as a single JSON secret.
pub struct KeyringCredentialStore {
    service: String,
    account: String,
}

impl KeyringCredentialStore {
    pub fn new(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, &self.account)?)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        let secret = serde_json::to_string(credentials)?;
        self.entry()?.set_password(&secret)?;
        debug!(service = %self.service, "Stored credentials in keychain");
        Ok(())
    }

    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// JSON file
// ============================================================================

/// Stores the token pair in a JSON file, replaced atomically via rename.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;
        let temp = self.temp_path();
        std::fs::write(&temp, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In memory
// ============================================================================

/// Process-local store for ephemeral sessions. Counts writes.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credentials>>,
    writes: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of `save` and `clear` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Credentials>>, StorageError> {
        self.slot
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        *self.slot()? = Some(credentials.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(self.slot()?.clone())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.slot()? = None;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

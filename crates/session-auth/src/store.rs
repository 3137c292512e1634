//! Access credential storage
//!
//! Holds the current access credential and the cached subject identity for
//! one session, plus the last saved refresh cookie so a restart does not lose
//! the ability to renew. Backed by memory only, or by a JSON state file that survives
//! restarts of the owning process. All writes use atomic temp-file + rename
//! and a tokio Mutex serializes them, so a reader never observes a partially
//! replaced credential.
//!
//! The store is an owned object handed to the pipeline, not a global: two
//! sessions in one process simply use two stores.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, Claims};
use crate::constants::REFRESH_COOKIE_NAME;
use crate::cookies::{CookieJar, CookieRecord};
use crate::error::{DecodeError, Error, Result};

/// Short-lived bearer credential. Redacted in Debug output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredential(Secret<String>);

impl AccessCredential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Secret::new(raw.into()))
    }

    /// Parse a credential delivered in a response header.
    ///
    /// Tolerates a leading `Bearer ` scheme. Returns `None` for blank values.
    pub fn from_header_value(value: &str) -> Option<Self> {
        let value = value.trim();
        let raw = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        if raw.is_empty() {
            None
        } else {
            Some(Self::new(raw))
        }
    }

    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose())
    }

    /// Decode the embedded claims. Not a security check.
    pub fn claims(&self) -> std::result::Result<Claims, DecodeError> {
        codec::decode(Some(self.expose()))
    }
}

/// On-disk shape of the session state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<CookieRecord>,
}

#[derive(Default)]
struct SessionState {
    access: Option<AccessCredential>,
    subject: Option<String>,
    refresh: Option<CookieRecord>,
}

impl SessionState {
    fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            access_token: self.access.as_ref().map(|c| c.expose().to_owned()),
            subject: self.subject.clone(),
            refresh_token: self.refresh.clone(),
        }
    }
}

/// Read-only view of the session for status endpoints and UI display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub subject: Option<String>,
    /// Credential expiry as unix seconds, when the claims carry one.
    pub expires_at: Option<u64>,
    pub expired: bool,
}

/// Session-scoped credential store.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<SessionState>,
}

impl CredentialStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Load session state from `path`.
    ///
    /// A missing file is a cold start with an empty session; the file is
    /// created on the first write. A present but unreadable file is an error.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let persisted: PersistedSession = serde_json::from_str(&contents)
                .map_err(|e| Error::StateParse(format!("parsing session file: {e}")))?;
            info!(
                path = %path.display(),
                authenticated = persisted.access_token.is_some(),
                renewable = persisted.refresh_token.is_some(),
                "loaded session state"
            );
            SessionState {
                access: persisted
                    .access_token
                    .as_deref()
                    .and_then(AccessCredential::from_header_value),
                subject: persisted.subject,
                refresh: persisted.refresh_token,
            }
        } else {
            info!(path = %path.display(), "session file not found, starting signed out");
            SessionState::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Current access credential, if any. Never fails.
    pub async fn get(&self) -> Option<AccessCredential> {
        self.state.lock().await.access.clone()
    }

    /// Replace the access credential wholesale.
    pub async fn set(&self, credential: AccessCredential) {
        let mut state = self.state.lock().await;
        state.access = Some(credential);
        debug!("access credential replaced");
        self.persist(&state).await;
    }

    /// Remove the access credential. Idempotent.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if state.access.take().is_some() {
            debug!("access credential cleared");
            self.persist(&state).await;
        }
    }

    /// Remove the access credential and the cached subject (sign-out).
    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        let had_any = state.access.take().is_some() | state.subject.take().is_some();
        if had_any {
            debug!("session state cleared");
            self.persist(&state).await;
        }
    }

    /// Cached subject identity.
    pub async fn subject(&self) -> Option<String> {
        self.state.lock().await.subject.clone()
    }

    /// Cache `subject` unless one is already present. Returns whether it was stored.
    pub async fn set_subject_if_absent(&self, subject: String) -> bool {
        let mut state = self.state.lock().await;
        if state.subject.is_some() {
            return false;
        }
        debug!(subject = %subject, "cached subject identity");
        state.subject = Some(subject);
        self.persist(&state).await;
        true
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        let claims = state.access.as_ref().and_then(|c| c.claims().ok());
        let expires_at = claims.as_ref().and_then(Claims::expires_at);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        SessionSnapshot {
            authenticated: state.access.is_some(),
            subject: state.subject.clone(),
            expires_at,
            expired: claims.is_some_and(|c| c.is_expired_at(now)),
        }
    }

    /// Save the jar's refresh cookie alongside the credential. Writes only
    /// when the cookie changed since the last save.
    pub async fn sync_refresh(&self, jar: &CookieJar) {
        let current = jar.record(REFRESH_COOKIE_NAME);
        let mut state = self.state.lock().await;
        if state.refresh == current {
            return;
        }
        debug!(present = current.is_some(), "refresh cookie changed");
        state.refresh = current;
        self.persist(&state).await;
    }

    /// Put the saved refresh cookie back into `jar`. Returns whether one was restored.
    pub async fn restore_refresh(&self, jar: &CookieJar) -> bool {
        let saved = self.state.lock().await.refresh.clone();
        match saved {
            Some(record) => jar.restore(REFRESH_COOKIE_NAME, record),
            None => false,
        }
    }

    /// Write-through to disk. In-memory state stays authoritative when the
    /// write fails; the failure is logged and the caller is not interrupted.
    async fn persist(&self, state: &SessionState) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, &state.to_persisted()).await {
            warn!(path = %path.display(), error = %e, "failed to persist session state");
        }
    }
}

/// Write session state atomically with 0600 permissions (it holds a bearer credential).
async fn write_atomic(path: &Path, data: &PersistedSession) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::StateParse(format!("serializing session state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating session directory: {e}")))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session state");
    Ok(())
}

//! # Session Persistence
//!
//! Durable snapshot of the non-live parts of a session, so a restarted process picks up
//! where the last one left off.
//!
//! ## What Is Saved:
//! - selected provider, instructions, call target and direction
//! - the call history ring buffer
//! - the last status and session id, for diagnostics only
//!
//! ## Restore Rules:
//! - files with a different `version` or older than `max_age` are ignored
//! - nothing live is restored: the manager stays `Idle` with no session id, and a new
//!   `connect` bootstraps a fresh session
//!
//! Writes go to a sibling temp file that is then renamed over the snapshot, so a crash
//! mid-write leaves the previous snapshot intact.

use crate::error::{VoiceError, VoiceResult};
use crate::session::{CallDirection, CallState, Provider, SessionManager};
use crate::transport::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub provider: Provider,
    pub instructions: Option<String>,
    pub target: Option<String>,
    pub direction: CallDirection,
    pub last_status: ConnectionState,
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub history: Vec<CallState>,
}

impl PersistedSession {
    /// Capture the current state of `manager`.
    pub fn capture(manager: &SessionManager) -> Self {
        let metadata = manager.metadata();
        let snapshot = manager.snapshot();
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            provider: metadata.provider,
            instructions: metadata.instructions,
            target: metadata.target,
            direction: metadata.direction,
            last_status: snapshot.status,
            last_session_id: snapshot.session_id,
            history: manager.store().history(),
        }
    }
}

pub struct SessionPersistence {
    path: PathBuf,
    max_age: Duration,
}

impl SessionPersistence {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn save(&self, manager: &SessionManager) -> VoiceResult<()> {
        self.write(&PersistedSession::capture(manager))
    }

    /// Write `snapshot` atomically.
    pub fn write(&self, snapshot: &PersistedSession) -> VoiceResult<()> {
        let io_error = |e: std::io::Error| {
            VoiceError::configuration(format!("cannot write session snapshot {}: {}", self.path.display(), e))
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| VoiceError::configuration(format!("cannot encode session snapshot: {}", e)))?;
        let temp = self.temp_path();
        std::fs::write(&temp, body).map_err(io_error)?;
        std::fs::rename(&temp, &self.path).map_err(io_error)?;
        debug!(path = %self.path.display(), status = %snapshot.last_status, "Session snapshot saved");
        Ok(())
    }

    /// Read the snapshot if there is a usable one.
    ///
    /// Missing, unreadable, foreign-version and expired files all yield `None`.
    pub fn load(&self) -> Option<PersistedSession> {
        let body = match std::fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read session snapshot");
                return None;
            }
        };
        let snapshot: PersistedSession = match serde_json::from_slice(&body) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt session snapshot");
                return None;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            info!(found = snapshot.version, expected = SNAPSHOT_VERSION, "Ignoring session snapshot from another version");
            return None;
        }
        let age = (Utc::now() - snapshot.saved_at).to_std().unwrap_or_default();
        if age > self.max_age {
            info!(age_secs = age.as_secs(), "Ignoring expired session snapshot");
            return None;
        }
        Some(snapshot)
    }

    /// Apply a saved snapshot to an idle manager. Returns whether anything was restored.
    pub fn restore(&self, manager: &SessionManager) -> VoiceResult<bool> {
        let Some(snapshot) = self.load() else {
            return Ok(false);
        };
        manager.set_provider(snapshot.provider)?;
        manager.update_instructions(snapshot.instructions);
        manager.set_call_target(snapshot.target, snapshot.direction);
        let calls = snapshot.history.len();
        manager.store().restore_history(snapshot.history);
        info!(
            provider = %snapshot.provider,
            calls,
            saved_at = %snapshot.saved_at,
            "Session restored from snapshot"
        );
        Ok(true)
    }

    pub fn clear(&self) -> VoiceResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VoiceError::configuration(format!(
                "cannot remove session snapshot {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Save on every published snapshot. Abort the returned handle to stop.
    pub fn spawn_autosave(self: Arc<Self>, manager: SessionManager) -> JoinHandle<()> {
        let mut updates = manager.subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let persistence = self.clone();
                let snapshot = PersistedSession::capture(&manager);
                let written = tokio::task::spawn_blocking(move || persistence.write(&snapshot)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Session autosave failed"),
                    Err(e) => warn!(error = %e, "Session autosave task failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BootstrapRequest, BootstrapResponse, CallStatus, SessionBootstrap, SessionOptions};
    use futures_util::future::BoxFuture;

    struct OfflineBootstrap;

    impl SessionBootstrap for OfflineBootstrap {
        fn create_session(&self, _request: BootstrapRequest) -> BoxFuture<'_, VoiceResult<BootstrapResponse>> {
            Box::pin(async move { Err(VoiceError::connection("offline")) })
        }

        fn start_session<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
            Box::pin(async move { Ok(()) })
        }

        fn end_session<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn manager() -> SessionManager {
        SessionManager::builder(SessionOptions::default(), Arc::new(OfflineBootstrap))
            .build()
            .unwrap()
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("voice-session-test-{}", uuid::Uuid::new_v4()))
            .join("session.json")
    }

    fn sample(saved_at: DateTime<Utc>) -> PersistedSession {
        let mut call = CallState::new(Some("+15550100".into()), CallDirection::Outbound, Provider::ProviderB);
        call.activate();
        call.finish(CallStatus::Ended);
        PersistedSession {
            version: SNAPSHOT_VERSION,
            saved_at,
            provider: Provider::ProviderB,
            instructions: Some("keep it short".into()),
            target: Some("+15550100".into()),
            direction: CallDirection::Inbound,
            last_status: ConnectionState::Connected,
            last_session_id: Some("s1".into()),
            history: vec![call],
        }
    }

    #[test]
    fn test_write_is_atomic_and_loadable() {
        let persistence = SessionPersistence::new(scratch_path(), Duration::from_secs(3600));
        let snapshot = sample(Utc::now());
        persistence.write(&snapshot).unwrap();

        assert!(!persistence.temp_path().exists());
        assert_eq!(persistence.load(), Some(snapshot));
        persistence.clear().unwrap();
        assert!(persistence.load().is_none());
    }

    #[test]
    fn test_expired_and_foreign_snapshots_are_ignored() {
        let persistence = SessionPersistence::new(scratch_path(), Duration::from_secs(3600));
        persistence
            .write(&sample(Utc::now() - chrono::Duration::hours(2)))
            .unwrap();
        assert!(persistence.load().is_none());

        let mut foreign = sample(Utc::now());
        foreign.version = SNAPSHOT_VERSION + 1;
        persistence.write(&foreign).unwrap();
        assert!(persistence.load().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let persistence = SessionPersistence::new(scratch_path(), Duration::from_secs(3600));
        std::fs::create_dir_all(persistence.path().parent().unwrap()).unwrap();
        std::fs::write(persistence.path(), b"{not json").unwrap();
        assert!(persistence.load().is_none());
    }

    #[tokio::test]
    async fn test_restore_applies_only_non_live_fields() {
        let persistence = SessionPersistence::new(scratch_path(), Duration::from_secs(3600));
        persistence.write(&sample(Utc::now())).unwrap();

        let manager = manager();
        assert!(persistence.restore(&manager).unwrap());

        let metadata = manager.metadata();
        assert_eq!(metadata.provider, Provider::ProviderB);
        assert_eq!(metadata.instructions.as_deref(), Some("keep it short"));
        assert_eq!(metadata.direction, CallDirection::Inbound);
        assert_eq!(manager.store().history().len(), 1);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionState::Idle);
        assert!(snapshot.session_id.is_none());
        assert_eq!(snapshot.provider, Provider::ProviderB);
    }

    #[tokio::test]
    async fn test_autosave_follows_published_snapshots() {
        let persistence = Arc::new(SessionPersistence::new(scratch_path(), Duration::from_secs(3600)));
        let manager = manager();
        let task = persistence.clone().spawn_autosave(manager.clone());

        manager.set_provider(Provider::ProviderC).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(persistence.load().unwrap().provider, Provider::ProviderC);
        task.abort();
    }
}

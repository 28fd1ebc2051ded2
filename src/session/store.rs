//! # Session Store
//!
//! Explicit state container owned by whoever composes the session manager.
//!
//! ## Subscribe Contract:
//! - **Snapshot** (`watch`): the whole `{status, provider, session_id, last_event, error}`
//!   object is replaced in one step, so a subscriber never observes a half-applied update
//! - **Events** (`broadcast`): transcriptions, sentiment, function calls, quality and level
//!   samples, and logged errors; slow subscribers lose the oldest events, never the snapshot

use crate::error::{ErrorInfo, VoiceError};
use crate::session::call::{CallHistory, CallState};
use crate::session::error_log::{ErrorLog, ErrorRecord, RecoveryAction};
use crate::session::Provider;
use crate::transport::message::{FunctionCall, ProviderError, Sentiment, Transcription};
use crate::transport::{ConnectionState, QualityStats, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Internally consistent view of the session, published atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: ConnectionState,
    pub provider: Provider,
    pub session_id: Option<String>,
    pub last_event: Option<String>,
    pub error: Option<ErrorInfo>,
    pub call: Option<CallState>,
    pub transport: TransportKind,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn idle(provider: Provider, transport: TransportKind) -> Self {
        Self {
            status: ConnectionState::Idle,
            provider,
            session_id: None,
            last_event: None,
            error: None,
            call: None,
            transport,
            updated_at: Utc::now(),
        }
    }
}

/// Application-level events, separate from the state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Transcription(Transcription),
    Sentiment(Sentiment),
    FunctionCall(FunctionCall),
    /// An error event sent by the provider itself.
    ProviderError(ProviderError),
    Quality(QualityStats),
    AudioLevel { input: f32, output: f32 },
    Error(ErrorRecord),
}

pub struct SessionStore {
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    quality: Mutex<QualityStats>,
    history: Mutex<CallHistory>,
    errors: Mutex<ErrorLog>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionStore {
    pub fn new(initial: SessionSnapshot, history_capacity: usize, error_capacity: usize) -> Self {
        let (snapshot, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            snapshot,
            events,
            quality: Mutex::new(QualityStats::default()),
            history: Mutex::new(CallHistory::new(history_capacity)),
            errors: Mutex::new(ErrorLog::new(error_capacity)),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Apply `change` and publish the result as one update.
    pub fn update(&self, change: impl FnOnce(&mut SessionSnapshot)) {
        self.snapshot.send_modify(|snapshot| {
            change(snapshot);
            snapshot.updated_at = Utc::now();
        });
    }

    /// Like [`update`](Self::update), but only publishes when `change` returns `true`.
    pub fn update_if(&self, change: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        self.snapshot.send_if_modified(|snapshot| {
            let changed = change(snapshot);
            if changed {
                snapshot.updated_at = Utc::now();
            }
            changed
        })
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Log an error, surface it on the snapshot and broadcast it.
    pub fn record_error(&self, error: &VoiceError, recovery: Option<RecoveryAction>) -> ErrorRecord {
        let record = ErrorRecord::new(error, recovery);
        lock(&self.errors).push(record.clone());
        let info = ErrorInfo::from(error);
        self.update(|s| {
            s.last_event = Some(format!("error: {}", info.code));
            s.error = Some(info);
        });
        self.publish(SessionEvent::Error(record.clone()));
        record
    }

    pub fn error(&self, id: Uuid) -> Option<ErrorRecord> {
        lock(&self.errors).get(id).cloned()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        lock(&self.errors).records()
    }

    pub fn archive_call(&self, call: CallState) {
        lock(&self.history).push(call);
    }

    pub fn history(&self) -> Vec<CallState> {
        lock(&self.history).entries()
    }

    pub fn restore_history(&self, calls: Vec<CallState>) {
        lock(&self.history).restore(calls);
    }

    pub fn set_quality(&self, quality: QualityStats) {
        *lock(&self.quality) = quality;
        self.publish(SessionEvent::Quality(quality));
    }

    pub fn quality(&self) -> QualityStats {
        *lock(&self.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::call::CallDirection;

    fn store() -> SessionStore {
        SessionStore::new(SessionSnapshot::idle(Provider::ProviderA, TransportKind::WebSocket), 4, 4)
    }

    #[test]
    fn test_update_is_published_whole() {
        let store = store();
        let mut rx = store.subscribe();
        store.update(|s| {
            s.status = ConnectionState::Connected;
            s.session_id = Some("s1".into());
            s.call = Some(CallState::new(None, CallDirection::Inbound, Provider::ProviderA));
        });
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.status, ConnectionState::Connected);
        assert_eq!(seen.session_id.as_deref(), Some("s1"));
        assert!(seen.call.is_some());
    }

    #[tokio::test]
    async fn test_record_error_updates_snapshot_log_and_events() {
        let store = store();
        let mut events = store.subscribe_events();
        let record = store.record_error(&VoiceError::connection("reset by peer"), Some(RecoveryAction::RetryConnection));

        assert_eq!(store.error(record.id).unwrap().recovery, Some(RecoveryAction::RetryConnection));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.error.unwrap().code, "connection_error");
        match events.recv().await.unwrap() {
            SessionEvent::Error(logged) => assert_eq!(logged.id, record.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = SessionEvent::AudioLevel { input: 0.5, output: 0.0 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "audio_level");
        assert_eq!(json["data"]["input"], 0.5);
    }
}

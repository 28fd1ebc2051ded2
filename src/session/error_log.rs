//! Bounded log of recent errors and the recovery actions a caller may invoke.

use crate::error::VoiceError;
use crate::session::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Explicit recovery a caller can trigger for a logged error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Bootstrap and connect again with the current provider.
    RetryConnection,
    /// Release and reacquire the microphone.
    RequestMicrophone,
    /// Reconnect to a specific provider.
    RestoreProvider { provider: Provider },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    pub recovery: Option<RecoveryAction>,
}

impl ErrorRecord {
    pub fn new(error: &VoiceError, recovery: Option<RecoveryAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: error.code().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
            recoverable: error.is_recoverable(),
            recovery: if error.is_recoverable() { recovery } else { None },
        }
    }
}

/// Default recovery for an error, when there is an obvious one.
pub fn default_recovery(error: &VoiceError) -> Option<RecoveryAction> {
    match error {
        VoiceError::PermissionDenied(_) | VoiceError::DeviceUnavailable(_) | VoiceError::AudioDevice(_) => {
            Some(RecoveryAction::RequestMicrophone)
        }
        VoiceError::Connection(_) => Some(RecoveryAction::RetryConnection),
        VoiceError::ProviderSwitch { .. } | VoiceError::Configuration(_) | VoiceError::Format(_) => None,
    }
}

/// Fixed-capacity error log, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: ErrorRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn get(&self, id: Uuid) -> Option<&ErrorRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_recoverable_errors_carry_no_recovery() {
        let record = ErrorRecord::new(
            &VoiceError::configuration("bad url"),
            Some(RecoveryAction::RetryConnection),
        );
        assert!(!record.recoverable);
        assert!(record.recovery.is_none());
        assert_eq!(record.code, "configuration_error");
    }

    #[test]
    fn test_default_recovery_by_kind() {
        assert_eq!(
            default_recovery(&VoiceError::PermissionDenied("no".into())),
            Some(RecoveryAction::RequestMicrophone)
        );
        assert_eq!(
            default_recovery(&VoiceError::connection("reset")),
            Some(RecoveryAction::RetryConnection)
        );
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = ErrorLog::new(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = ErrorRecord::new(&VoiceError::connection(format!("drop {}", i)), None);
            ids.push(record.id);
            log.push(record);
        }
        assert_eq!(log.len(), 3);
        assert!(log.get(ids[0]).is_none());
        assert!(log.get(ids[4]).is_some());
        assert!(log.records()[0].message.contains("drop 2"));
    }

    #[test]
    fn test_recovery_action_serde_shape() {
        let json = serde_json::to_value(RecoveryAction::RestoreProvider {
            provider: Provider::ProviderB,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"action": "restore_provider", "provider": "provider_b"}));
    }
}

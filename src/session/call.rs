//! User-visible call records and the bounded call history.

use crate::session::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Connecting,
    Active,
    Ended,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    #[default]
    Outbound,
}

/// One logical call. Survives provider switches; only its `provider` changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    pub id: Uuid,
    /// Phone number or other target identifier.
    pub target: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    /// Set when the call first becomes active.
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub provider: Provider,
}

impl CallState {
    pub fn new(target: Option<String>, direction: CallDirection, provider: Provider) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            direction,
            status: CallStatus::Connecting,
            start_time: None,
            end_time: None,
            provider,
        }
    }

    /// Mark active; the start time is kept from the first activation.
    pub fn activate(&mut self) {
        self.status = CallStatus::Active;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
    }

    pub fn finish(&mut self, status: CallStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, CallStatus::Ended | CallStatus::Error) && self.end_time.is_some()
    }

    /// Seconds since the call became active, up to its end.
    pub fn duration_secs(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Fixed-capacity history of finished calls, oldest evicted first.
#[derive(Debug, Clone)]
pub struct CallHistory {
    entries: VecDeque<CallState>,
    capacity: usize,
}

impl CallHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, call: CallState) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(call);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<CallState> {
        self.entries.iter().cloned().collect()
    }

    /// Replace the contents, keeping only the newest `capacity` entries.
    pub fn restore(&mut self, calls: Vec<CallState>) {
        self.entries.clear();
        for call in calls {
            self.push(call);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_keeps_first_start_time() {
        let mut call = CallState::new(Some("+15550100".into()), CallDirection::Outbound, Provider::ProviderA);
        assert_eq!(call.status, CallStatus::Connecting);
        assert_eq!(call.duration_secs(), 0.0);

        call.activate();
        let started = call.start_time;
        call.provider = Provider::ProviderB;
        call.activate();
        assert_eq!(call.start_time, started);

        call.finish(CallStatus::Ended);
        assert!(call.is_finished());
        assert!(call.duration_secs() >= 0.0);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = CallHistory::new(2);
        let calls: Vec<CallState> = (0..3)
            .map(|i| CallState::new(Some(format!("target-{}", i)), CallDirection::Inbound, Provider::ProviderA))
            .collect();
        for call in calls.clone() {
            history.push(call);
        }
        assert_eq!(history.len(), 2);
        let kept = history.entries();
        assert_eq!(kept[0].id, calls[1].id);
        assert_eq!(kept[1].id, calls[2].id);
    }
}

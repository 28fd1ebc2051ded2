//! # Connection State Machine
//!
//! Both transports move through the same explicit state machine. Every change goes
//! through [`transition`], so an illegal move is an `Err` instead of a silent overwrite.
//!
//! ## States and Events:
//! ```text
//! Idle ──Connect──▶ Connecting ──Opened──▶ Connected
//!                     │  ▲                    │
//!            OpenFailed  RetryFired         Dropped
//!                     ▼  │                    ▼
//!               Disconnected ──RetryScheduled──▶ Reconnecting
//!                     │
//!                   GaveUp ──▶ Failed
//!
//! any state ──Disconnect──▶ Idle
//! ```
//!
//! ## Generations:
//! Every `Connect` and every `Disconnect` starts a new generation. Background tasks tag
//! their transitions with the generation they were started under; a transition from an
//! older generation is rejected, which is how a reconnect timer that fires after
//! `disconnect()` ends up doing nothing.

use crate::transport::TransportEvent;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Connecting, connected, or on the way back.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked for a connection.
    Connect,
    /// Handshake completed.
    Opened,
    /// Handshake failed or timed out.
    OpenFailed,
    /// An established connection closed unexpectedly.
    Dropped,
    /// A retry is waiting on its backoff delay.
    RetryScheduled,
    /// The backoff delay elapsed.
    RetryFired,
    /// Retry budget exhausted.
    GaveUp,
    /// Caller-initiated disconnect. Legal from every state.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition: {event:?} in state {from}")]
    Illegal { from: ConnectionState, event: ConnectionEvent },

    #[error("stale transition from generation {got}, current is {current}")]
    Stale { got: u64, current: u64 },
}

/// The transition function.
pub fn transition(from: ConnectionState, event: ConnectionEvent) -> Result<ConnectionState, TransitionError> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let to = match (from, event) {
        (_, E::Disconnect) => S::Idle,
        (S::Idle | S::Failed | S::Disconnected, E::Connect) => S::Connecting,
        (S::Connecting, E::Opened) => S::Connected,
        (S::Connecting, E::OpenFailed) => S::Disconnected,
        (S::Connected, E::Dropped) => S::Disconnected,
        (S::Disconnected, E::RetryScheduled) => S::Reconnecting,
        (S::Reconnecting, E::RetryFired) => S::Connecting,
        (S::Disconnected, E::GaveUp) => S::Failed,
        (from, event) => return Err(TransitionError::Illegal { from, event }),
    };
    Ok(to)
}

#[derive(Debug)]
struct Machine {
    state: ConnectionState,
    generation: u64,
    transitions: u64,
}

/// Shared, generation-guarded holder of one transport's connection state.
///
/// Publishes every accepted transition on a `watch` channel (latest value) and, when
/// attached, as [`TransportEvent::StateChanged`] on the transport's event channel.
#[derive(Debug)]
pub struct StateCell {
    machine: Mutex<Machine>,
    watch_tx: watch::Sender<ConnectionState>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl StateCell {
    pub fn new(events: Option<mpsc::UnboundedSender<TransportEvent>>) -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            machine: Mutex::new(Machine {
                state: ConnectionState::Idle,
                generation: 0,
                transitions: 0,
            }),
            watch_tx,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of accepted transitions so far.
    pub fn transitions(&self) -> u64 {
        self.lock().transitions
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Start a new connection generation (`Connect`). Returns the generation to tag
    /// subsequent transitions with.
    pub fn begin(&self) -> Result<u64, TransitionError> {
        let mut machine = self.lock();
        let next = transition(machine.state, ConnectionEvent::Connect)?;
        machine.generation += 1;
        let generation = machine.generation;
        self.apply(&mut machine, next);
        Ok(generation)
    }

    /// Apply `event` on behalf of a task started under `generation`.
    pub fn advance(&self, generation: u64, event: ConnectionEvent) -> Result<ConnectionState, TransitionError> {
        let mut machine = self.lock();
        if machine.generation != generation {
            return Err(TransitionError::Stale {
                got: generation,
                current: machine.generation,
            });
        }
        let next = transition(machine.state, event)?;
        self.apply(&mut machine, next);
        Ok(next)
    }

    /// Caller-initiated disconnect: invalidate every outstanding task and go to `Idle`.
    pub fn cancel(&self) -> ConnectionState {
        let mut machine = self.lock();
        machine.generation += 1;
        if machine.state != ConnectionState::Idle {
            self.apply(&mut machine, ConnectionState::Idle);
        }
        ConnectionState::Idle
    }

    fn apply(&self, machine: &mut Machine, next: ConnectionState) {
        let from = machine.state;
        machine.state = next;
        machine.transitions += 1;
        debug!(%from, to = %next, generation = machine.generation, "Connection state changed");
        self.watch_tx.send_replace(next);
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::StateChanged(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn test_happy_path_and_reconnect_cycle() {
        let mut state = S::Idle;
        for (event, expected) in [
            (E::Connect, S::Connecting),
            (E::Opened, S::Connected),
            (E::Dropped, S::Disconnected),
            (E::RetryScheduled, S::Reconnecting),
            (E::RetryFired, S::Connecting),
            (E::OpenFailed, S::Disconnected),
            (E::GaveUp, S::Failed),
        ] {
            state = transition(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        assert!(transition(S::Idle, E::Opened).is_err());
        assert!(transition(S::Connected, E::Connect).is_err());
        assert!(transition(S::Failed, E::RetryFired).is_err());
        assert!(transition(S::Reconnecting, E::GaveUp).is_err());
    }

    #[test]
    fn test_disconnect_is_legal_everywhere() {
        for state in [S::Idle, S::Connecting, S::Connected, S::Reconnecting, S::Disconnected, S::Failed] {
            assert_eq!(transition(state, E::Disconnect).unwrap(), S::Idle);
        }
    }

    #[test]
    fn test_stale_generation_cannot_transition() {
        let cell = StateCell::new(None);
        let generation = cell.begin().unwrap();
        cell.advance(generation, E::OpenFailed).unwrap();
        cell.advance(generation, E::RetryScheduled).unwrap();

        cell.cancel();
        let before = cell.transitions();
        // The pending retry timer fires after the disconnect.
        let late = cell.advance(generation, E::RetryFired);
        assert!(matches!(late, Err(TransitionError::Stale { .. })));
        assert_eq!(cell.current(), S::Idle);
        assert_eq!(cell.transitions(), before);
    }

    #[test]
    fn test_transitions_are_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cell = StateCell::new(Some(tx));
        let watch = cell.subscribe();
        let generation = cell.begin().unwrap();
        cell.advance(generation, E::Opened).unwrap();

        assert_eq!(*watch.borrow(), S::Connected);
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::StateChanged(S::Connecting))));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::StateChanged(S::Connected))));
    }
}

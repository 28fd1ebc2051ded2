//! # Transports
//!
//! Two interchangeable ways of moving audio and messages to a provider.
//!
//! ## Key Components:
//! - **WsTransport**: reconnecting duplex WebSocket with JSON envelopes and binary audio
//! - **PeerTransport**: WebRTC peer connection negotiated over HTTP signaling
//! - **StateCell**: the shared connection state machine both of them drive
//! - **ReconnectPolicy**: exponential backoff with a retry budget
//!
//! ## Events:
//! A transport reports everything through one [`TransportEvent`] channel handed to it at
//! construction. The session manager owns the receiving end; nothing above the transport
//! ever sees a socket.

pub mod backoff;
pub mod message;
pub mod state;
pub mod webrtc;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use message::{InboundMessage, OutboundMessage};
pub use state::{ConnectionEvent, ConnectionState, StateCell};
pub use webrtc::PeerTransport;
pub use websocket::WsTransport;

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Everything a transport reports to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Message(InboundMessage),
    /// Audio in the session downlink wire format.
    Audio(Vec<u8>),
    Quality(QualityStats),
    /// A failure the owner should record, e.g. an exhausted retry budget.
    Error(VoiceError),
}

/// Link quality sampled on a fixed interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub latency_ms: f64,
    pub packet_loss_percent: f64,
    /// Normalized 0.0..=1.0; filled in by the owner from the capture level meter.
    pub audio_level: f32,
    pub bitrate_kbps: f64,
}

/// How outbound audio frames are put on a duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFraming {
    /// Raw binary frames next to JSON text frames.
    #[default]
    Binary,
    /// Base64 inside an `input_audio` JSON envelope.
    Base64Json,
}

/// Bearer token source for transport authentication.
///
/// `Provider` is called on every connection attempt, so a refreshed token applies to
/// reconnects without rebuilding the transport.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Static(String),
    Provider(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl Credentials {
    pub fn from_fn(provider: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Credentials::Provider(Arc::new(provider))
    }

    /// Resolve the token for one connection attempt.
    pub fn token(&self) -> Option<String> {
        match self {
            Credentials::None => None,
            Credentials::Static(token) => Some(token.clone()),
            Credentials::Provider(provider) => provider(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => f.write_str("Credentials::None"),
            Credentials::Static(_) => f.write_str("Credentials::Static(..)"),
            Credentials::Provider(_) => f.write_str("Credentials::Provider(..)"),
        }
    }
}

/// Settings shared by both transports.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout: Duration,
    pub keepalive: Duration,
    pub stats_interval: Duration,
    pub audio_framing: AudioFraming,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(15),
            stats_interval: Duration::from_secs(1),
            audio_framing: AudioFraming::Binary,
        }
    }
}

/// Counters kept by a transport for the lifetime of the handle.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_sent: AtomicU64,
    /// Sends attempted while not connected.
    pub sends_dropped: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub sends_dropped: u64,
    pub reconnect_attempts: u64,
}

impl TransportCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "webrtc")]
    WebRtc,
}

impl std::str::FromStr for TransportKind {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "webrtc" | "rtc" => Ok(TransportKind::WebRtc),
            other => Err(VoiceError::configuration(format!("unknown transport: {}", other))),
        }
    }
}

/// The single transport bound to a session at any time.
pub enum ActiveTransport {
    WebSocket(WsTransport),
    Peer(PeerTransport),
}

impl ActiveTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            ActiveTransport::WebSocket(_) => TransportKind::WebSocket,
            ActiveTransport::Peer(_) => TransportKind::WebRtc,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            ActiveTransport::WebSocket(t) => t.state(),
            ActiveTransport::Peer(t) => t.state(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        match self {
            ActiveTransport::WebSocket(t) => t.subscribe_state(),
            ActiveTransport::Peer(t) => t.subscribe_state(),
        }
    }

    pub async fn connect(&mut self, endpoint: &str, credentials: Credentials) -> VoiceResult<()> {
        match self {
            ActiveTransport::WebSocket(t) => t.connect(endpoint, credentials),
            ActiveTransport::Peer(t) => t.connect(endpoint, credentials).await,
        }
    }

    /// Wait until the transport is connected or has given up.
    pub async fn wait_connected(&self, timeout: Duration) -> VoiceResult<()> {
        let reconnect_enabled = match self {
            ActiveTransport::WebSocket(t) => t.settings().reconnect.enabled,
            ActiveTransport::Peer(t) => t.settings().reconnect.enabled,
        };
        wait_for_connected(self.subscribe_state(), reconnect_enabled, timeout).await
    }

    /// Send a JSON envelope; dropped with a warning when not connected.
    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        match self {
            ActiveTransport::WebSocket(t) => t.send(message),
            ActiveTransport::Peer(t) => t.send(message),
        }
    }

    /// Send encoded uplink audio; dropped with a warning when not connected.
    pub fn send_audio(&self, encoded: &[u8], sequence: u64) -> bool {
        match self {
            ActiveTransport::WebSocket(t) => t.send_audio(encoded, sequence),
            ActiveTransport::Peer(t) => t.send_audio(encoded),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        match self {
            ActiveTransport::WebSocket(t) => t.counters(),
            ActiveTransport::Peer(t) => t.counters(),
        }
    }

    /// Tear down immediately. The state is `Idle` when this returns.
    pub fn disconnect(&mut self) {
        match self {
            ActiveTransport::WebSocket(t) => t.disconnect(),
            ActiveTransport::Peer(t) => t.disconnect(),
        }
    }
}

/// Resolve once `rx` reports `Connected`, or fail once it reaches a terminal state.
pub(crate) async fn wait_for_connected(
    mut rx: watch::Receiver<ConnectionState>,
    reconnect_enabled: bool,
    timeout: Duration,
) -> VoiceResult<()> {
    let wait = async {
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(VoiceError::connection("connection failed")),
                ConnectionState::Idle => return Err(VoiceError::connection("transport was disconnected")),
                ConnectionState::Disconnected if !reconnect_enabled => {
                    return Err(VoiceError::connection("connection closed"))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(VoiceError::connection("transport dropped"));
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| VoiceError::connection(format!("handshake timed out after {} ms", timeout.as_millis())))?
}

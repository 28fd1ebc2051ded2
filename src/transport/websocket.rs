//! # Reconnecting WebSocket Transport
//!
//! Duplex JSON/binary channel to a provider with automatic reconnection.
//!
//! ## Connection Flow:
//! 1. `connect()` validates the endpoint, enters `Connecting` and spawns a driver task
//! 2. The driver resolves credentials, performs the handshake and enters `Connected`
//! 3. On failure or an unexpected close it backs off and retries until the budget runs out
//! 4. `disconnect()` moves to `Idle` immediately; the driver notices and exits quietly
//!
//! ## Delivery:
//! Each connection has its own outbound queue, written in order by the driver. Messages
//! queued on a connection that drops are lost with it and are not replayed on the next
//! one. `send()` while not connected logs a warning and drops the message.

use crate::error::{VoiceError, VoiceResult};
use crate::transport::message::{decode_inbound, InboundMessage, OutboundMessage};
use crate::transport::state::{ConnectionEvent, ConnectionState, StateCell};
use crate::transport::{AudioFraming, CounterSnapshot, Credentials, QualityStats, TransportCounters, TransportEvent, TransportSettings};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

fn lock_slot(slot: &OutboundSlot) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reconnecting duplex WebSocket client.
pub struct WsTransport {
    settings: TransportSettings,
    cell: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: OutboundSlot,
    counters: Arc<TransportCounters>,
    shutdown: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
    endpoint: Option<String>,
}

impl WsTransport {
    pub fn new(settings: TransportSettings, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            settings,
            cell: Arc::new(StateCell::new(Some(events.clone()))),
            events,
            outbound: Arc::new(Mutex::new(None)),
            counters: Arc::new(TransportCounters::default()),
            shutdown: None,
            driver: None,
            endpoint: None,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.cell.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.cell.subscribe()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Accepted state transitions so far; stops moving after `disconnect()`.
    pub fn transitions(&self) -> u64 {
        self.cell.transitions()
    }

    /// Start connecting to `endpoint` (`ws://` or `wss://`).
    ///
    /// Returns once the driver is running; the outcome arrives through the state stream.
    /// A no-op while already connecting, connected or reconnecting.
    pub fn connect(&mut self, endpoint: &str, credentials: Credentials) -> VoiceResult<()> {
        let state = self.cell.current();
        if state.is_active() {
            debug!(%state, "Connect ignored, transport already active");
            return Ok(());
        }

        let url = url::Url::parse(endpoint)
            .map_err(|e| VoiceError::configuration(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(VoiceError::configuration(format!(
                "endpoint must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if let Some(previous) = self.shutdown.take() {
            let _ = previous.send(true);
        }

        let generation = self
            .cell
            .begin()
            .map_err(|e| VoiceError::connection(e.to_string()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            endpoint: endpoint.to_string(),
            credentials,
            generation,
            settings: self.settings.clone(),
            cell: self.cell.clone(),
            events: self.events.clone(),
            outbound: self.outbound.clone(),
            counters: self.counters.clone(),
        };

        info!(endpoint = %endpoint, generation, "WebSocket transport connecting");
        self.driver = Some(tokio::spawn(driver.run(shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        self.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    /// Queue a JSON envelope on the current connection.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if !self.ready_to_send() {
            return false;
        }
        match message.to_json() {
            Ok(text) => self.enqueue(Message::Text(text)),
            Err(e) => {
                warn!(error = %e, "Failed to encode outbound message");
                false
            }
        }
    }

    /// Queue encoded uplink audio using the configured framing.
    pub fn send_audio(&self, encoded: &[u8], sequence: u64) -> bool {
        if !self.ready_to_send() {
            return false;
        }
        match self.settings.audio_framing {
            AudioFraming::Binary => self.enqueue(Message::Binary(encoded.to_vec())),
            AudioFraming::Base64Json => match OutboundMessage::input_audio(encoded, sequence).to_json() {
                Ok(text) => self.enqueue(Message::Text(text)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode audio envelope");
                    false
                }
            },
        }
    }

    fn ready_to_send(&self) -> bool {
        let state = self.cell.current();
        if state == ConnectionState::Connected {
            return true;
        }
        self.counters.sends_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(%state, "Dropping outbound message, transport not connected");
        false
    }

    fn enqueue(&self, message: Message) -> bool {
        match lock_slot(&self.outbound).as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                self.counters.sends_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Stop reconnecting, close the channel and go to `Idle` before returning.
    pub fn disconnect(&mut self) {
        let previous = self.cell.current();
        self.cell.cancel();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        lock_slot(&self.outbound).take();
        self.driver.take();
        if previous != ConnectionState::Idle {
            info!(from = %previous, "WebSocket transport disconnected");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Why one established connection ended.
enum ConnectionEnd {
    Shutdown,
    Dropped(String),
}

struct OpenFailure {
    message: String,
    /// Authentication rejections are not retried.
    permanent: bool,
}

/// Background task owning the socket for one connection generation.
struct Driver {
    endpoint: String,
    credentials: Credentials,
    generation: u64,
    settings: TransportSettings,
    cell: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: OutboundSlot,
    counters: Arc<TransportCounters>,
}

impl Driver {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let policy = self.settings.reconnect;
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                opened = self.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *lock_slot(&self.outbound) = Some(tx);
                    if self.cell.advance(self.generation, ConnectionEvent::Opened).is_err() {
                        lock_slot(&self.outbound).take();
                        return;
                    }
                    attempt = 0;
                    info!(endpoint = %self.endpoint, "WebSocket connected");

                    let end = self.pump(stream, rx, &mut shutdown).await;
                    if self.cell.generation() == self.generation {
                        lock_slot(&self.outbound).take();
                    }
                    match end {
                        ConnectionEnd::Shutdown => return,
                        ConnectionEnd::Dropped(reason) => {
                            if self.cell.advance(self.generation, ConnectionEvent::Dropped).is_err() {
                                return;
                            }
                            warn!(endpoint = %self.endpoint, reason = %reason, "WebSocket connection lost");
                            if !policy.enabled {
                                let _ = self
                                    .events
                                    .send(TransportEvent::Error(VoiceError::connection(format!("connection closed: {}", reason))));
                                return;
                            }
                        }
                    }
                }
                Err(failure) => {
                    if self.cell.advance(self.generation, ConnectionEvent::OpenFailed).is_err() {
                        return;
                    }
                    warn!(endpoint = %self.endpoint, attempt, error = %failure.message, "WebSocket connect failed");
                    if failure.permanent || !policy.enabled {
                        self.give_up(&failure.message);
                        return;
                    }
                }
            }

            attempt += 1;
            if !policy.should_retry(attempt) {
                self.give_up(&format!("reconnect budget of {} attempts exhausted", policy.max_attempts));
                return;
            }
            let delay = policy.delay(attempt);
            if self.cell.advance(self.generation, ConnectionEvent::RetryScheduled).is_err() {
                return;
            }
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.cell.advance(self.generation, ConnectionEvent::RetryFired).is_err() {
                return;
            }
        }
    }

    fn give_up(&self, reason: &str) {
        if self.cell.advance(self.generation, ConnectionEvent::GaveUp).is_ok() {
            error!(endpoint = %self.endpoint, reason = %reason, "WebSocket transport failed");
            let _ = self.events.send(TransportEvent::Error(VoiceError::connection(reason)));
        }
    }

    async fn open(&self) -> Result<WsStream, OpenFailure> {
        let request = build_request(&self.endpoint, &self.credentials).map_err(|e| OpenFailure {
            message: e.to_string(),
            permanent: true,
        })?;

        match tokio::time::timeout(self.settings.handshake_timeout, connect_async(request)).await {
            Err(_) => Err(OpenFailure {
                message: format!("handshake timed out after {} ms", self.settings.handshake_timeout.as_millis()),
                permanent: false,
            }),
            Ok(Err(e)) => Err(OpenFailure {
                permanent: is_auth_rejection(&e),
                message: e.to_string(),
            }),
            Ok(Ok((stream, _response))) => Ok(stream),
        }
    }

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionEnd {
        let (mut sink, mut source) = stream.split();
        let keepalive_period = self.settings.keepalive;
        let stats_period = self.settings.stats_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive_period, keepalive_period);
        let mut stats = tokio::time::interval_at(Instant::now() + stats_period, stats_period);
        let mut latency_ms = 0.0;
        let mut window_start = Instant::now();
        let mut window_bytes = self.bytes_total();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
                Some(message) = outbound.recv() => {
                    let len = message.len() as u64;
                    if let Err(e) = sink.send(message).await {
                        return ConnectionEnd::Dropped(e.to_string());
                    }
                    self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.counters.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                        self.handle_text(&text, &mut latency_ms);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                        let _ = self.events.send(TransportEvent::Audio(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return ConnectionEnd::Dropped(format!("closed by peer {}", reason).trim_end().to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ConnectionEnd::Dropped(e.to_string()),
                    None => return ConnectionEnd::Dropped("stream ended".to_string()),
                },
                _ = keepalive.tick() => {
                    if let Ok(text) = OutboundMessage::ping_now().to_json() {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return ConnectionEnd::Dropped(e.to_string());
                        }
                    }
                }
                _ = stats.tick() => {
                    let total = self.bytes_total();
                    let elapsed = window_start.elapsed().as_secs_f64().max(f64::EPSILON);
                    let bitrate_kbps = (total - window_bytes) as f64 * 8.0 / elapsed / 1000.0;
                    window_bytes = total;
                    window_start = Instant::now();
                    let _ = self.events.send(TransportEvent::Quality(QualityStats {
                        latency_ms,
                        packet_loss_percent: 0.0,
                        audio_level: 0.0,
                        bitrate_kbps,
                    }));
                }
            }
        }
    }

    fn bytes_total(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed) + self.counters.bytes_received.load(Ordering::Relaxed)
    }

    fn handle_text(&self, text: &str, latency_ms: &mut f64) {
        let Some(message) = decode_inbound(text) else {
            return;
        };
        match message {
            InboundMessage::Pong(pong) => {
                let now = chrono::Utc::now().timestamp_millis();
                *latency_ms = (now - pong.timestamp).max(0) as f64;
                debug!(latency_ms = *latency_ms, "Keep-alive round trip");
            }
            InboundMessage::Audio(payload) => match payload.decode() {
                Some(bytes) => {
                    let _ = self.events.send(TransportEvent::Audio(bytes));
                }
                None => warn!("Dropping audio envelope with invalid base64"),
            },
            other => {
                let _ = self.events.send(TransportEvent::Message(other));
            }
        }
    }
}

/// Build the handshake request, attaching a bearer token when one is available.
pub(crate) fn build_request(endpoint: &str, credentials: &Credentials) -> VoiceResult<Request> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| VoiceError::configuration(format!("invalid endpoint '{}': {}", endpoint, e)))?;
    if let Some(token) = credentials.token() {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| VoiceError::configuration("token contains characters not allowed in a header"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn is_auth_rejection(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(response) => matches!(response.status().as_u16(), 401 | 403),
        _ => false,
    }
}

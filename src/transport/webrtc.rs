//! # WebRTC Peer Transport
//!
//! Lower-latency alternative to the WebSocket transport. Audio travels on a media track,
//! JSON envelopes on a data channel, and the connection state follows ICE.
//!
//! ## Seams:
//! - **PeerConnector / PeerConnection**: the peer engine (browser bridge or native stack)
//! - **Signaling**: offer/answer exchange; [`HttpSignaling`] posts the offer over HTTP
//!
//! ## ICE to Connection State:
//! - `connected`/`completed` while connecting: `Connected`
//! - `disconnected`/`failed` while connected: `Disconnected`, then an ICE restart after the
//!   usual backoff delay (`Reconnecting` → `Connecting`)
//! - failed first negotiation: `Disconnected`, then a fresh offer after the backoff delay
//! - budget exhausted: `Failed`
//!
//! ## Side Channel:
//! Auxiliary media (screen share) is added and removed on the same peer without touching
//! the connection state.

use crate::error::{VoiceError, VoiceResult};
use crate::transport::message::{decode_inbound, InboundMessage, OutboundMessage};
use crate::transport::state::{ConnectionEvent, ConnectionState, StateCell};
use crate::transport::{wait_for_connected, CounterSnapshot, Credentials, QualityStats, TransportCounters, TransportEvent, TransportSettings};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// ICE connection states as reported by the peer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Cumulative counters read from the peer engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerStats {
    pub round_trip_time_ms: f64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Callbacks from the peer engine, delivered as a typed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceState(IceConnectionState),
    /// Decoded remote audio in the session downlink format.
    RemoteAudio(Vec<u8>),
    /// Text received on the data channel.
    DataMessage(String),
}

/// One negotiated peer connection.
pub trait PeerConnection: Send + Sync {
    /// Create a local offer; `ice_restart` requests fresh ICE credentials.
    fn create_offer(&self, ice_restart: bool) -> BoxFuture<'_, VoiceResult<String>>;

    fn apply_answer(&self, sdp: String) -> BoxFuture<'_, VoiceResult<()>>;

    /// Write encoded uplink audio to the local audio track.
    fn send_audio(&self, encoded: &[u8]) -> VoiceResult<()>;

    /// Send text on the data channel.
    fn send_data(&self, text: &str) -> VoiceResult<()>;

    fn stats(&self) -> BoxFuture<'_, VoiceResult<PeerStats>>;

    fn add_aux_track(&self, label: &str) -> BoxFuture<'_, VoiceResult<()>>;

    fn remove_aux_track(&self);

    fn close(&self);
}

/// Factory for peer connections.
pub trait PeerConnector: Send + Sync {
    /// Create a fresh peer with local audio bound; its callbacks go to `events`.
    fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> BoxFuture<'_, VoiceResult<Arc<dyn PeerConnection>>>;
}

/// Offer/answer exchange with the remote side.
pub trait Signaling: Send + Sync {
    fn exchange<'a>(&'a self, endpoint: &'a str, offer: String, token: Option<String>) -> BoxFuture<'a, VoiceResult<String>>;
}

#[derive(Debug, Deserialize)]
struct SdpAnswer {
    sdp: String,
}

/// Signaling by `POST`ing the offer as `application/sdp`.
///
/// The answer may come back as raw SDP or as JSON `{"sdp": ...}`.
#[derive(Debug, Clone, Default)]
pub struct HttpSignaling {
    client: reqwest::Client,
}

impl HttpSignaling {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Signaling for HttpSignaling {
    fn exchange<'a>(&'a self, endpoint: &'a str, offer: String, token: Option<String>) -> BoxFuture<'a, VoiceResult<String>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(endpoint)
                .header(reqwest::header::CONTENT_TYPE, "application/sdp")
                .body(offer);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| VoiceError::connection(format!("SDP exchange request failed: {}", e)))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(VoiceError::connection(format!(
                    "SDP exchange failed with status {}: {}",
                    status, body
                )));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = response
                .text()
                .await
                .map_err(|e| VoiceError::connection(format!("failed to read SDP answer: {}", e)))?;

            if content_type.contains("application/sdp") {
                Ok(body)
            } else {
                let parsed: SdpAnswer = serde_json::from_str(&body)
                    .map_err(|e| VoiceError::connection(format!("invalid SDP answer: {}", e)))?;
                Ok(parsed.sdp)
            }
        })
    }
}

struct PeerLink {
    peer: Arc<dyn PeerConnection>,
    endpoint: String,
    credentials: Credentials,
    shutdown: watch::Sender<bool>,
}

/// WebRTC transport with ICE-restart reconnection and live quality stats.
pub struct PeerTransport {
    settings: TransportSettings,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn Signaling>,
    cell: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    counters: Arc<TransportCounters>,
    link: Option<PeerLink>,
    aux_label: Option<String>,
}

impl PeerTransport {
    pub fn new(
        settings: TransportSettings,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn Signaling>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            settings,
            connector,
            signaling,
            cell: Arc::new(StateCell::new(Some(events.clone()))),
            events,
            counters: Arc::new(TransportCounters::default()),
            link: None,
            aux_label: None,
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
        self.link.as_ref().map(|l| l.endpoint.as_str())
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn aux_share_active(&self) -> bool {
        self.aux_label.is_some()
    }

    /// Negotiate a peer connection against the signaling `endpoint`.
    ///
    /// Returns after the answer is applied; `Connected` follows once ICE connects. A failed
    /// negotiation is retried with the reconnect backoff and returned once the budget is spent.
    pub async fn connect(&mut self, endpoint: &str, credentials: Credentials) -> VoiceResult<()> {
        let state = self.cell.current();
        if state.is_active() {
            debug!(%state, "Connect ignored, peer transport already active");
            return Ok(());
        }
        let url = url::Url::parse(endpoint)
            .map_err(|e| VoiceError::configuration(format!("invalid signaling endpoint '{}': {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VoiceError::configuration(format!(
                "signaling endpoint must use http:// or https://, got {}://",
                url.scheme()
            )));
        }

        let generation = self
            .cell
            .begin()
            .map_err(|e| VoiceError::connection(e.to_string()))?;
        info!(endpoint = %endpoint, generation, "Peer transport negotiating");

        let policy = self.settings.reconnect;
        let mut attempt: u32 = 0;
        let (peer, peer_events) = loop {
            let negotiated = match tokio::time::timeout(
                self.settings.handshake_timeout,
                negotiate(self.connector.as_ref(), self.signaling.as_ref(), endpoint, &credentials),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(VoiceError::connection("peer negotiation timed out")),
            };
            let e = match negotiated {
                Ok(negotiated) => break negotiated,
                Err(e) => e,
            };

            if self.cell.advance(generation, ConnectionEvent::OpenFailed).is_err() {
                return Err(VoiceError::connection("connect cancelled"));
            }
            warn!(endpoint = %endpoint, attempt, error = %e, "Peer negotiation failed");
            attempt += 1;
            if !policy.should_retry(attempt) {
                if self.cell.advance(generation, ConnectionEvent::GaveUp).is_ok() {
                    error!(endpoint = %endpoint, error = %e, "Peer transport failed");
                }
                return Err(e);
            }
            if self.cell.advance(generation, ConnectionEvent::RetryScheduled).is_err() {
                return Err(VoiceError::connection("connect cancelled"));
            }
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = policy.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling peer negotiation retry");
            tokio::time::sleep(delay).await;
            if self.cell.advance(generation, ConnectionEvent::RetryFired).is_err() {
                return Err(VoiceError::connection("connect cancelled"));
            }
        };

        if self.cell.generation() != generation {
            peer.close();
            return Err(VoiceError::connection("connect cancelled"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Monitor {
            generation,
            endpoint: endpoint.to_string(),
            credentials: credentials.clone(),
            peer: peer.clone(),
            signaling: self.signaling.clone(),
            settings: self.settings.clone(),
            cell: self.cell.clone(),
            events: self.events.clone(),
            counters: self.counters.clone(),
        };
        tokio::spawn(monitor.run(peer_events, shutdown_rx));

        self.link = Some(PeerLink {
            peer,
            endpoint: endpoint.to_string(),
            credentials,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    /// Send a JSON envelope on the data channel.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let Some(peer) = self.connected_peer() else {
            return false;
        };
        let sent = message
            .to_json()
            .map_err(|e| VoiceError::connection(e.to_string()))
            .and_then(|text| {
                peer.send_data(&text)?;
                Ok(text.len())
            });
        self.record_send(sent)
    }

    /// Write encoded uplink audio to the local track.
    pub fn send_audio(&self, encoded: &[u8]) -> bool {
        let Some(peer) = self.connected_peer() else {
            return false;
        };
        let sent = peer.send_audio(encoded).map(|_| encoded.len());
        self.record_send(sent)
    }

    fn connected_peer(&self) -> Option<&Arc<dyn PeerConnection>> {
        let state = self.cell.current();
        match (&self.link, state) {
            (Some(link), ConnectionState::Connected) => Some(&link.peer),
            _ => {
                self.counters.sends_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%state, "Dropping outbound data, peer transport not connected");
                None
            }
        }
    }

    fn record_send(&self, sent: VoiceResult<usize>) -> bool {
        match sent {
            Ok(len) => {
                self.counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(error = %e, "Peer send failed");
                false
            }
        }
    }

    /// Start the auxiliary media side channel.
    pub async fn start_aux_share(&mut self, label: &str) -> VoiceResult<()> {
        let link = match (&self.link, self.cell.current()) {
            (Some(link), ConnectionState::Connected) => link,
            (_, state) => {
                return Err(VoiceError::connection(format!(
                    "cannot share media while {}",
                    state
                )))
            }
        };
        link.peer.add_aux_track(label).await?;
        info!(label = %label, "Auxiliary media share started");
        self.aux_label = Some(label.to_string());
        Ok(())
    }

    /// Stop the auxiliary media side channel. Never changes the audio connection state.
    pub fn stop_aux_share(&mut self) {
        if let Some(label) = self.aux_label.take() {
            if let Some(link) = &self.link {
                link.peer.remove_aux_track();
            }
            info!(label = %label, "Auxiliary media share stopped");
        }
    }

    /// Close the peer and go to `Idle` before returning.
    pub fn disconnect(&mut self) {
        let previous = self.cell.current();
        self.cell.cancel();
        self.aux_label = None;
        if let Some(link) = self.link.take() {
            let _ = link.shutdown.send(true);
            link.peer.close();
        }
        if previous != ConnectionState::Idle {
            info!(from = %previous, "Peer transport disconnected");
        }
    }

    /// Renegotiate against a new endpoint, restoring the previous one on failure.
    pub async fn switch_endpoint(&mut self, endpoint: &str, credentials: Credentials) -> VoiceResult<()> {
        let previous = self
            .link
            .as_ref()
            .map(|l| (l.endpoint.clone(), l.credentials.clone()));
        self.disconnect();

        let attempt = match self.connect(endpoint, credentials).await {
            Ok(()) => wait_for_connected(self.subscribe_state(), false, self.settings.handshake_timeout).await,
            Err(e) => Err(e),
        };
        let failure = match attempt {
            Ok(()) => {
                info!(endpoint = %endpoint, "Peer transport switched endpoint");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(endpoint = %endpoint, error = %failure, "Endpoint switch failed, restoring previous peer");
        self.disconnect();
        let rolled_back = match previous {
            Some((old_endpoint, old_credentials)) => {
                let restored = match self.connect(&old_endpoint, old_credentials).await {
                    Ok(()) => wait_for_connected(self.subscribe_state(), false, self.settings.handshake_timeout).await,
                    Err(e) => Err(e),
                };
                restored.is_ok()
            }
            None => false,
        };
        Err(VoiceError::provider_switch(failure.to_string(), rolled_back))
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

type Negotiated = (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>);

async fn negotiate(
    connector: &dyn PeerConnector,
    signaling: &dyn Signaling,
    endpoint: &str,
    credentials: &Credentials,
) -> VoiceResult<Negotiated> {
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = connector.create(tx).await?;
    let result = async {
        let offer = peer.create_offer(false).await?;
        let answer = signaling.exchange(endpoint, offer, credentials.token()).await?;
        peer.apply_answer(answer).await
    }
    .await;
    match result {
        Ok(()) => Ok((peer, rx)),
        Err(e) => {
            peer.close();
            Err(e)
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Background task following one peer's ICE state for one generation.
struct Monitor {
    generation: u64,
    endpoint: String,
    credentials: Credentials,
    peer: Arc<dyn PeerConnection>,
    signaling: Arc<dyn Signaling>,
    settings: TransportSettings,
    cell: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    counters: Arc<TransportCounters>,
}

impl Monitor {
    async fn run(self, mut peer_events: mpsc::UnboundedReceiver<PeerEvent>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.stats_interval;
        let mut stats_tick = tokio::time::interval_at(Instant::now() + period, period);
        let mut previous = PeerStats::default();
        let mut sampled_at = Instant::now();
        let mut attempt: u32 = 0;
        let mut deadline = Some(Instant::now() + self.settings.handshake_timeout);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = sleep_until_opt(deadline) => {
                    deadline = None;
                    if !self.recover(&mut attempt, ConnectionEvent::OpenFailed, "ICE did not connect in time", &mut shutdown).await {
                        return;
                    }
                    deadline = Some(Instant::now() + self.settings.handshake_timeout);
                }
                event = peer_events.recv() => {
                    let Some(event) = event else {
                        self.lose_peer("peer engine closed");
                        return;
                    };
                    match event {
                        PeerEvent::IceState(ice) => {
                            let state = self.cell.current();
                            match (ice, state) {
                                (IceConnectionState::Connected | IceConnectionState::Completed, ConnectionState::Connecting) => {
                                    if self.cell.advance(self.generation, ConnectionEvent::Opened).is_err() {
                                        return;
                                    }
                                    attempt = 0;
                                    deadline = None;
                                    info!(endpoint = %self.endpoint, "Peer transport connected");
                                }
                                (IceConnectionState::Disconnected | IceConnectionState::Failed | IceConnectionState::Closed, ConnectionState::Connected) => {
                                    if !self.recover(&mut attempt, ConnectionEvent::Dropped, "ICE connection lost", &mut shutdown).await {
                                        return;
                                    }
                                    deadline = Some(Instant::now() + self.settings.handshake_timeout);
                                }
                                (IceConnectionState::Failed | IceConnectionState::Closed, ConnectionState::Connecting) => {
                                    if !self.recover(&mut attempt, ConnectionEvent::OpenFailed, "ICE negotiation failed", &mut shutdown).await {
                                        return;
                                    }
                                    deadline = Some(Instant::now() + self.settings.handshake_timeout);
                                }
                                (ice, state) => debug!(?ice, %state, "ICE state"),
                            }
                        }
                        PeerEvent::RemoteAudio(bytes) => {
                            self.counters.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            let _ = self.events.send(TransportEvent::Audio(bytes));
                        }
                        PeerEvent::DataMessage(text) => {
                            self.counters.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                            match decode_inbound(&text) {
                                Some(InboundMessage::Audio(payload)) => {
                                    if let Some(bytes) = payload.decode() {
                                        let _ = self.events.send(TransportEvent::Audio(bytes));
                                    }
                                }
                                Some(message) => {
                                    let _ = self.events.send(TransportEvent::Message(message));
                                }
                                None => {}
                            }
                        }
                    }
                }
                _ = stats_tick.tick() => {
                    if self.cell.current() != ConnectionState::Connected {
                        continue;
                    }
                    match self.peer.stats().await {
                        Ok(current) => {
                            let elapsed = sampled_at.elapsed().as_secs_f64().max(f64::EPSILON);
                            let quality = quality_between(&previous, &current, elapsed);
                            previous = current;
                            sampled_at = Instant::now();
                            let _ = self.events.send(TransportEvent::Quality(quality));
                        }
                        Err(e) => debug!(error = %e, "Peer stats unavailable"),
                    }
                }
            }
        }
    }

    /// Record the loss, then retry with ICE restarts until one is accepted or the budget
    /// runs out. Returns `false` when the monitor should exit.
    async fn recover(
        &self,
        attempt: &mut u32,
        event: ConnectionEvent,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        if self.cell.advance(self.generation, event).is_err() {
            return false;
        }
        warn!(endpoint = %self.endpoint, reason = %reason, "Peer connection interrupted");

        let policy = self.settings.reconnect;
        loop {
            *attempt += 1;
            if !policy.should_retry(*attempt) {
                self.give_up(if policy.enabled {
                    "ICE restart budget exhausted"
                } else {
                    reason
                });
                return false;
            }
            if self.cell.advance(self.generation, ConnectionEvent::RetryScheduled).is_err() {
                return false;
            }
            self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = policy.delay(*attempt);
            info!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "Scheduling ICE restart");

            tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.cell.advance(self.generation, ConnectionEvent::RetryFired).is_err() {
                return false;
            }

            let restarted = tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                restarted = tokio::time::timeout(self.settings.handshake_timeout, self.ice_restart()) => restarted,
            };
            match restarted {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => warn!(attempt = *attempt, error = %e, "ICE restart failed"),
                Err(_) => warn!(attempt = *attempt, "ICE restart timed out"),
            }
            if self.cell.advance(self.generation, ConnectionEvent::OpenFailed).is_err() {
                return false;
            }
        }
    }

    async fn ice_restart(&self) -> VoiceResult<()> {
        let offer = self.peer.create_offer(true).await?;
        let answer = self
            .signaling
            .exchange(&self.endpoint, offer, self.credentials.token())
            .await?;
        self.peer.apply_answer(answer).await
    }

    fn give_up(&self, reason: &str) {
        if self.cell.advance(self.generation, ConnectionEvent::GaveUp).is_ok() {
            error!(endpoint = %self.endpoint, reason = %reason, "Peer transport failed");
            let _ = self.events.send(TransportEvent::Error(VoiceError::connection(reason)));
        }
    }

    fn lose_peer(&self, reason: &str) {
        let event = match self.cell.current() {
            ConnectionState::Connected => ConnectionEvent::Dropped,
            ConnectionState::Connecting => ConnectionEvent::OpenFailed,
            _ => return,
        };
        if self.cell.advance(self.generation, event).is_ok() {
            self.give_up(reason);
        }
    }
}

/// Quality over one sampling window from two cumulative readings.
fn quality_between(previous: &PeerStats, current: &PeerStats, elapsed_secs: f64) -> QualityStats {
    let received = current.packets_received.saturating_sub(previous.packets_received);
    let lost = current.packets_lost.saturating_sub(previous.packets_lost);
    let expected = received + lost;
    let packet_loss_percent = if expected == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / expected as f64
    };
    let bytes = current.bytes_sent.saturating_sub(previous.bytes_sent)
        + current.bytes_received.saturating_sub(previous.bytes_received);
    QualityStats {
        latency_ms: current.round_trip_time_ms,
        packet_loss_percent,
        audio_level: 0.0,
        bitrate_kbps: bytes as f64 * 8.0 / elapsed_secs / 1000.0,
    }
}

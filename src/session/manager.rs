//! # Session Manager
//!
//! Owns the session, the call and exactly one bound transport, plus the capture and
//! playback engines.
//!
//! ## Generations:
//! Every `connect`, `switch_provider` and `disconnect` starts a new generation. Work that
//! finishes under an older generation (a slow bootstrap response, a handshake, a queued
//! transport event) is dropped instead of applied, so a later call always wins.
//!
//! ## Switching Providers:
//! 1. Retire the bound transport and end its provider session (best-effort)
//! 2. Bootstrap a fresh session for the new provider and connect to it
//! 3. On failure, reconnect to the last provider that was connected; the call record is
//!    kept either way and only marked `error` when nothing could be restored
//!
//! ## Audio Path:
//! Captured frames cross from the device thread through a bounded FIFO, get encoded to
//! the uplink wire format here, and are sent only while the transport is `Connected`.
//! Downlink audio from the transport goes straight to the playback scheduler.

use crate::audio::capture::{frame_handoff, CaptureEngine, CaptureEvent, CaptureStatus, FrameReceiver};
use crate::audio::device::{AudioInput, AudioOutput, CaptureConstraints, UnavailableInput, VirtualOutput};
use crate::audio::format::encode_for_wire;
use crate::audio::frame::{AudioFrame, WireFormat};
use crate::audio::playback::PlaybackEngine;
use crate::error::{VoiceError, VoiceResult};
use crate::session::bootstrap::{derive_transport_path, resolve_endpoint, BootstrapRequest, BootstrapResponse, SessionBootstrap};
use crate::session::call::{CallDirection, CallState, CallStatus};
use crate::session::error_log::{default_recovery, RecoveryAction};
use crate::session::store::{SessionEvent, SessionSnapshot, SessionStore};
use crate::session::Provider;
use crate::transport::message::{InboundMessage, OutboundMessage, SessionSettings};
use crate::transport::webrtc::{PeerConnector, Signaling};
use crate::transport::{
    ActiveTransport, ConnectionState, CounterSnapshot, Credentials, PeerTransport, TransportEvent, TransportKind,
    TransportSettings, WsTransport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the manager needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Category sent as `provider_type` in the bootstrap body.
    pub provider_type: String,
    pub default_provider: Provider,
    pub transport: TransportKind,
    pub transport_settings: TransportSettings,
    /// Bootstrap-to-`Connected` limit for one connect or switch.
    pub handshake_timeout: Duration,
    pub uplink: WireFormat,
    pub downlink: WireFormat,
    pub capture: CaptureConstraints,
    pub frame_duration_ms: u32,
    pub level_smoothing: f32,
    /// How often `AudioLevel` events are published while capturing.
    pub level_interval: Duration,
    pub handoff_capacity: usize,
    pub history_capacity: usize,
    pub error_log_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider_type: "voice_ai".to_string(),
            default_provider: Provider::default(),
            transport: TransportKind::WebSocket,
            transport_settings: TransportSettings::default(),
            handshake_timeout: Duration::from_secs(15),
            uplink: WireFormat::default_uplink(),
            downlink: WireFormat::default_downlink(),
            capture: CaptureConstraints::default(),
            frame_duration_ms: 20,
            level_smoothing: 0.8,
            level_interval: Duration::from_millis(250),
            handoff_capacity: 64,
            history_capacity: 50,
            error_log_capacity: 100,
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> VoiceResult<()> {
        self.uplink.validate()?;
        self.downlink.validate()?;
        self.capture.validate()?;
        if self.provider_type.trim().is_empty() {
            return Err(VoiceError::configuration("provider_type must not be empty"));
        }
        if self.frame_duration_ms == 0 || self.handoff_capacity == 0 {
            return Err(VoiceError::configuration(
                "frame duration and hand-off capacity must be greater than 0",
            ));
        }
        if self.handshake_timeout.is_zero() || self.level_interval.is_zero() {
            return Err(VoiceError::configuration("timeouts and intervals must be greater than 0"));
        }
        Ok(())
    }
}

/// Local session metadata. Carried forward across provider switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub provider: Provider,
    pub instructions: Option<String>,
    pub target: Option<String>,
    pub direction: CallDirection,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Resolved transport endpoint of the bound session.
    pub endpoint: Option<String>,
    /// Path and query derived from the bootstrap `websocket_url`.
    pub transport_path: Option<String>,
}

impl SessionMetadata {
    fn new(provider: Provider) -> Self {
        Self {
            provider,
            instructions: None,
            target: None,
            direction: CallDirection::default(),
            created_at: None,
            last_activity_at: None,
            endpoint: None,
            transport_path: None,
        }
    }
}

/// Counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub capture: CaptureStatus,
    pub frames_captured: u64,
    /// Frames lost because the hand-off queue was full.
    pub frames_dropped: u64,
    pub frames_sent: u64,
    /// Frames discarded because no transport was connected.
    pub frames_skipped: u64,
    pub chunks_played: u64,
    pub playback_errors: u64,
    pub buffered_seconds: f64,
    pub input_level: f32,
    pub output_level: f32,
    pub errors_logged: usize,
    pub transport: Option<CounterSnapshot>,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    playback_errors: AtomicU64,
}

#[derive(Default)]
struct Binding {
    generation: u64,
    transport: Option<ActiveTransport>,
    session_id: Option<String>,
    /// Provider of the last transport that reached `Connected`.
    provider: Option<Provider>,
}

#[derive(Default)]
struct AudioTasks {
    uplink: Option<JoinHandle<()>>,
    device_events: Option<JoinHandle<()>>,
    level: Option<JoinHandle<()>>,
    dropped: Option<Arc<AtomicU64>>,
}

enum EstablishError {
    /// A newer operation took over; nothing to report.
    Stale,
    Failed(VoiceError),
}

impl From<VoiceError> for EstablishError {
    fn from(error: VoiceError) -> Self {
        EstablishError::Failed(error)
    }
}

type PeerEngine = (Arc<dyn PeerConnector>, Arc<dyn Signaling>);

struct Inner {
    options: SessionOptions,
    bootstrap: Arc<dyn SessionBootstrap>,
    credentials: Credentials,
    peer: Option<PeerEngine>,
    store: Arc<SessionStore>,
    generation: watch::Sender<u64>,
    binding: Mutex<Binding>,
    metadata: RwLock<SessionMetadata>,
    capture: Mutex<CaptureEngine>,
    playback: Mutex<PlaybackEngine>,
    audio: Mutex<AudioTasks>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves once `generations` moves past `generation`.
async fn superseded(generations: &mut watch::Receiver<u64>, generation: u64) {
    while *generations.borrow_and_update() == generation {
        if generations.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    options: SessionOptions,
    bootstrap: Arc<dyn SessionBootstrap>,
    credentials: Credentials,
    store: Option<Arc<SessionStore>>,
    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn AudioOutput>>,
    peer: Option<PeerEngine>,
}

impl SessionManagerBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Use a store owned by the caller instead of a fresh one.
    pub fn store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn input(mut self, input: Box<dyn AudioInput>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Box<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    /// Peer engine and signaling used when the transport is WebRTC.
    pub fn peer_engine(mut self, connector: Arc<dyn PeerConnector>, signaling: Arc<dyn Signaling>) -> Self {
        self.peer = Some((connector, signaling));
        self
    }

    pub fn build(self) -> VoiceResult<SessionManager> {
        let options = self.options;
        options.validate()?;
        if options.transport == TransportKind::WebRtc && self.peer.is_none() {
            return Err(VoiceError::configuration("the webrtc transport needs a peer engine"));
        }

        let store = self.store.unwrap_or_else(|| {
            Arc::new(SessionStore::new(
                SessionSnapshot::idle(options.default_provider, options.transport),
                options.history_capacity,
                options.error_log_capacity,
            ))
        });
        let input = self.input.unwrap_or_else(|| Box::new(UnavailableInput));
        let output = self
            .output
            .unwrap_or_else(|| Box::new(VirtualOutput::realtime(options.downlink.sample_rate)));

        let capture = CaptureEngine::new(input, options.frame_duration_ms, options.level_smoothing);
        let playback = PlaybackEngine::new(output, options.level_smoothing);
        let (generation, _) = watch::channel(0);
        let provider = store.snapshot().provider;

        info!(
            provider = %provider,
            transport = ?options.transport,
            uplink = %options.uplink,
            downlink = %options.downlink,
            "Session manager ready"
        );

        Ok(SessionManager {
            inner: Arc::new(Inner {
                bootstrap: self.bootstrap,
                credentials: self.credentials,
                peer: self.peer,
                store,
                generation,
                binding: Mutex::new(Binding::default()),
                metadata: RwLock::new(SessionMetadata::new(provider)),
                capture: Mutex::new(capture),
                playback: Mutex::new(playback),
                audio: Mutex::new(AudioTasks::default()),
                counters: Counters::default(),
                options,
            }),
        })
    }
}

/// Provider session manager. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(options: SessionOptions, bootstrap: Arc<dyn SessionBootstrap>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            options,
            bootstrap,
            credentials: Credentials::None,
            store: None,
            input: None,
            output: None,
            peer: None,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.store.subscribe()
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.inner.read_metadata().clone()
    }

    pub fn provider(&self) -> Provider {
        self.inner.read_metadata().provider
    }

    /// Bootstrap a session with the current provider and connect to it.
    ///
    /// A no-op while connecting or connected. When a later `disconnect` or switch takes
    /// over first, this returns `Ok` without binding anything.
    pub async fn connect(&self) -> VoiceResult<()> {
        let metadata = self.metadata();
        let provider = metadata.provider;
        let call = CallState::new(metadata.target.clone(), metadata.direction, provider);
        let call_id = call.id;
        let transport = self.inner.options.transport;

        // The activity check and the generation bump happen under the snapshot lock, so
        // of two racing connects only one gets past this point.
        let mut claimed = None;
        let mut previous_call = None;
        self.inner.store.update_if(|s| {
            if s.status.is_active() {
                return false;
            }
            claimed = Some(self.inner.next_generation());
            previous_call = s.call.replace(call);
            s.status = ConnectionState::Connecting;
            s.provider = provider;
            s.session_id = None;
            s.error = None;
            s.transport = transport;
            s.last_event = Some("connecting".to_string());
            true
        });
        let Some(generation) = claimed else {
            debug!(status = %self.snapshot().status, "Connect ignored, session already active");
            return Ok(());
        };

        self.inner.retire_transport();
        if let Some(call) = previous_call {
            self.inner.archive_call(call);
        }
        info!(provider = %provider, call_id = %call_id, "Connecting session");

        match self.inner.establish(provider, generation).await {
            Ok(()) => Ok(()),
            Err(EstablishError::Stale) => {
                debug!(provider = %provider, "Connect superseded");
                Ok(())
            }
            Err(EstablishError::Failed(error)) => {
                warn!(provider = %provider, error = %error, "Session connect failed");
                if self.inner.is_current(generation) {
                    self.inner.mark_failed(generation);
                    self.inner.store.record_error(&error, default_recovery(&error));
                }
                Err(error)
            }
        }
    }

    /// End the session: stop audio, tear down the transport and return to idle.
    ///
    /// Synchronous and callable in any state. Any connect or switch still in flight is
    /// abandoned and its late results are discarded.
    pub fn disconnect(&self) {
        self.inner.next_generation();
        self.inner.retire_transport();
        self.stop_audio();
        lock(&self.inner.playback).interrupt();

        let mut archived = None;
        self.inner.store.update(|s| {
            archived = s.call.take();
            s.status = ConnectionState::Idle;
            s.session_id = None;
            s.error = None;
            s.last_event = Some("disconnected".to_string());
        });
        if let Some(call) = archived {
            self.inner.archive_call(call);
        }

        let mut metadata = self.inner.write_metadata();
        metadata.endpoint = None;
        metadata.transport_path = None;
    }

    /// Move the live call to another provider.
    ///
    /// A no-op for the current provider. While idle this only selects the provider for the
    /// next `connect`.
    pub async fn switch_provider(&self, provider: Provider) -> VoiceResult<()> {
        let previous = self.provider();
        if provider == previous {
            debug!(provider = %provider, "Switch ignored, provider already selected");
            return Ok(());
        }
        let snapshot = self.inner.store.snapshot();
        if !snapshot.status.is_active() {
            self.inner.select_provider(provider);
            return Ok(());
        }

        let generation = self.inner.next_generation();
        let fallback = self.inner.retire_transport().unwrap_or(previous);
        info!(from = %previous, to = %provider, "Switching provider");
        self.inner.select_provider(provider);
        self.inner.update_current(generation, |s| {
            s.status = ConnectionState::Connecting;
            s.session_id = None;
            s.last_event = Some(format!("switching to {}", provider));
        });

        let failure = match self.inner.establish(provider, generation).await {
            Ok(()) => return Ok(()),
            Err(EstablishError::Stale) => {
                debug!(provider = %provider, "Switch superseded");
                return Ok(());
            }
            Err(EstablishError::Failed(error)) => error,
        };

        warn!(to = %provider, back_to = %fallback, error = %failure, "Provider switch failed, restoring");
        self.inner.select_provider(fallback);
        self.inner.update_current(generation, |s| {
            s.last_event = Some(format!("restoring {}", fallback));
        });

        match self.inner.establish(fallback, generation).await {
            Ok(()) => {
                let error = VoiceError::provider_switch(failure.to_string(), true);
                self.inner.store.record_error(&error, None);
                Err(error)
            }
            Err(EstablishError::Stale) => Err(VoiceError::provider_switch(failure.to_string(), false)),
            Err(EstablishError::Failed(restore)) => {
                warn!(provider = %fallback, error = %restore, "Previous provider could not be restored");
                let error = VoiceError::provider_switch(failure.to_string(), false);
                if self.inner.is_current(generation) {
                    self.inner.mark_failed(generation);
                    self.inner
                        .store
                        .record_error(&error, Some(RecoveryAction::RestoreProvider { provider: fallback }));
                }
                Err(error)
            }
        }
    }

    /// Select the provider for the next `connect`. Refused while a session is active.
    pub fn set_provider(&self, provider: Provider) -> VoiceResult<()> {
        let status = self.inner.store.snapshot().status;
        if status.is_active() {
            return Err(VoiceError::configuration(format!(
                "cannot change provider while {}; use switch_provider",
                status
            )));
        }
        self.inner.select_provider(provider);
        Ok(())
    }

    /// Replace the instructions and push them to the provider when connected.
    ///
    /// Returns whether an `update` envelope was sent.
    pub fn update_instructions(&self, instructions: Option<String>) -> bool {
        self.inner.write_metadata().instructions = instructions.clone();
        let binding = lock(&self.inner.binding);
        match binding.transport.as_ref() {
            Some(transport) if transport.state() == ConnectionState::Connected => {
                transport.send_message(&OutboundMessage::Update { instructions })
            }
            _ => false,
        }
    }

    /// Target and direction used for the next call.
    pub fn set_call_target(&self, target: Option<String>, direction: CallDirection) {
        let mut metadata = self.inner.write_metadata();
        metadata.target = target;
        metadata.direction = direction;
    }

    /// Open the microphone and start streaming frames to the bound transport.
    ///
    /// Device errors are returned directly and also logged with a `RequestMicrophone`
    /// recovery.
    pub fn start_audio(&self) -> VoiceResult<()> {
        let (consumer, frames) = frame_handoff(self.inner.options.handoff_capacity);
        let dropped = frames.dropped_counter();
        let device_events = {
            let mut capture = lock(&self.inner.capture);
            if capture.is_capturing() {
                debug!("Audio already running");
                return Ok(());
            }
            capture.set_consumer(consumer);
            let device_events = capture.subscribe_events();
            if let Err(error) = capture.start_capture(&self.inner.options.capture) {
                capture.clear_consumer();
                drop(capture);
                self.inner.store.record_error(&error, default_recovery(&error));
                return Err(error);
            }
            device_events
        };

        let weak = Arc::downgrade(&self.inner);
        let mut tasks = lock(&self.inner.audio);
        tasks.abort();
        tasks.uplink = Some(tokio::spawn(run_uplink(weak.clone(), frames)));
        tasks.device_events = Some(tokio::spawn(run_device_events(weak.clone(), device_events)));
        tasks.level = Some(tokio::spawn(run_level_meter(weak, self.inner.options.level_interval)));
        tasks.dropped = Some(dropped);
        Ok(())
    }

    /// Release the microphone. Frames already captured still drain to the transport.
    pub fn stop_audio(&self) {
        {
            let mut capture = lock(&self.inner.capture);
            capture.stop_capture();
            capture.clear_consumer();
        }
        let mut tasks = lock(&self.inner.audio);
        if let Some(dropped) = tasks.dropped.take() {
            self.inner
                .counters
                .frames_dropped
                .fetch_add(dropped.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        // The uplink task ends by itself once the hand-off closes.
        tasks.uplink.take();
        if let Some(task) = tasks.device_events.take() {
            task.abort();
        }
        if let Some(task) = tasks.level.take() {
            task.abort();
        }
    }

    /// Run the recovery action attached to a logged error.
    pub async fn recover(&self, error_id: Uuid) -> VoiceResult<()> {
        let record = self
            .inner
            .store
            .error(error_id)
            .ok_or_else(|| VoiceError::configuration(format!("no logged error with id {}", error_id)))?;
        let action = record
            .recovery
            .ok_or_else(|| VoiceError::configuration(format!("error {} has no recovery action", error_id)))?;
        info!(error_id = %error_id, code = %record.code, action = ?action, "Running recovery action");

        match action {
            RecoveryAction::RetryConnection => self.connect().await,
            RecoveryAction::RequestMicrophone => {
                self.stop_audio();
                self.start_audio()
            }
            RecoveryAction::RestoreProvider { provider } => {
                if self.inner.store.snapshot().status.is_active() {
                    self.switch_provider(provider).await
                } else {
                    self.inner.select_provider(provider);
                    self.connect().await
                }
            }
        }
    }

    /// Schedule decoded PCM16 on the playback engine directly.
    pub fn play(&self, buffer: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<()> {
        lock(&self.inner.playback).play(buffer, sample_rate, channels)?;
        Ok(())
    }

    /// Flush the output device, e.g. write its recording to disk.
    pub fn flush_playback(&self) -> VoiceResult<()> {
        lock(&self.inner.playback).flush()
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.inner.counters;
        let (capture, input_level) = {
            let capture = lock(&self.inner.capture);
            (capture.status(), capture.level())
        };
        let (chunks_played, buffered_seconds, output_level) = {
            let playback = lock(&self.inner.playback);
            (playback.chunks_played(), playback.buffered(), playback.level())
        };
        let pending_dropped = lock(&self.inner.audio)
            .dropped
            .as_ref()
            .map(|d| d.load(Ordering::Relaxed))
            .unwrap_or(0);
        let transport = lock(&self.inner.binding).transport.as_ref().map(|t| t.counters());

        SessionStats {
            capture,
            frames_captured: counters.frames_captured.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed) + pending_dropped,
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_skipped: counters.frames_skipped.load(Ordering::Relaxed),
            chunks_played,
            playback_errors: counters.playback_errors.load(Ordering::Relaxed),
            buffered_seconds,
            input_level,
            output_level,
            errors_logged: self.inner.store.errors().len(),
            transport,
        }
    }
}

impl AudioTasks {
    fn abort(&mut self) {
        for task in [self.uplink.take(), self.device_events.take(), self.level.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl Inner {
    fn read_metadata(&self) -> std::sync::RwLockReadGuard<'_, SessionMetadata> {
        self.metadata.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metadata(&self) -> std::sync::RwLockWriteGuard<'_, SessionMetadata> {
        self.metadata.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn next_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            next = *g;
        });
        next
    }

    /// Apply `change` to the snapshot unless `generation` has been superseded.
    fn update_current(&self, generation: u64, change: impl FnOnce(&mut SessionSnapshot)) -> bool {
        self.store.update_if(|s| {
            if !self.is_current(generation) {
                return false;
            }
            change(s);
            true
        })
    }

    fn select_provider(&self, provider: Provider) {
        self.write_metadata().provider = provider;
        self.store.update(|s| {
            s.provider = provider;
            if let Some(call) = s.call.as_mut() {
                call.provider = provider;
            }
        });
    }

    /// Close out `call` and move it into the history.
    fn archive_call(&self, mut call: CallState) {
        if !call.is_finished() {
            let status = if call.status == CallStatus::Error {
                CallStatus::Error
            } else {
                CallStatus::Ended
            };
            call.finish(status);
        }
        info!(call_id = %call.id, status = ?call.status, duration_secs = call.duration_secs(), "Call archived");
        self.store.archive_call(call);
    }

    fn mark_failed(&self, generation: u64) {
        self.update_current(generation, |s| {
            s.status = ConnectionState::Failed;
            if let Some(call) = s.call.as_mut() {
                call.finish(CallStatus::Error);
            }
            s.last_event = Some("failed".to_string());
        });
    }

    fn touch(&self) {
        self.write_metadata().last_activity_at = Some(Utc::now());
    }

    /// Unbind and tear down the current transport, ending its provider session.
    ///
    /// Returns the provider that was last connected, which outlives the binding.
    fn retire_transport(&self) -> Option<Provider> {
        let (transport, session_id, provider) = {
            let mut binding = lock(&self.binding);
            (binding.transport.take(), binding.session_id.take(), binding.provider)
        };
        if let Some(mut transport) = transport {
            transport.disconnect();
        }
        if let Some(session_id) = session_id {
            info!(session_id = %session_id, "Session retired");
            self.end_session_detached(session_id);
        }
        provider
    }

    fn end_session_detached(&self, session_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %session_id, "No runtime to send the session end notice");
            return;
        };
        let bootstrap = self.bootstrap.clone();
        handle.spawn(async move {
            if let Err(e) = bootstrap.end_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Session end notice failed");
            }
        });
    }

    fn build_transport(&self, events: mpsc::UnboundedSender<TransportEvent>) -> VoiceResult<ActiveTransport> {
        let settings = self.options.transport_settings.clone();
        match self.options.transport {
            TransportKind::WebSocket => Ok(ActiveTransport::WebSocket(WsTransport::new(settings, events))),
            TransportKind::WebRtc => {
                let (connector, signaling) = self
                    .peer
                    .clone()
                    .ok_or_else(|| VoiceError::configuration("the webrtc transport needs a peer engine"))?;
                Ok(ActiveTransport::Peer(PeerTransport::new(settings, connector, signaling, events)))
            }
        }
    }

    /// Bootstrap, connect and bind one session for `provider` under `generation`.
    async fn establish(self: &Arc<Self>, provider: Provider, generation: u64) -> Result<(), EstablishError> {
        let request = BootstrapRequest {
            provider_type: self.options.provider_type.clone(),
            provider,
        };
        let response = self.bootstrap.create_session(request).await?;
        if !self.is_current(generation) {
            info!(session_id = %response.session_id, provider = %provider, "Discarding late bootstrap response");
            self.end_session_detached(response.session_id);
            return Err(EstablishError::Stale);
        }

        let session_id = response.session_id.clone();
        let result = self.open_transport(provider, generation, &response).await;
        if result.is_err() {
            self.end_session_detached(session_id);
        }
        result
    }

    async fn open_transport(
        self: &Arc<Self>,
        provider: Provider,
        generation: u64,
        response: &BootstrapResponse,
    ) -> Result<(), EstablishError> {
        let endpoint = resolve_endpoint(self.bootstrap.base_url(), &response.websocket_url, self.options.transport)?;
        let transport_path = derive_transport_path(endpoint.as_str())?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut transport = self.build_transport(events_tx)?;

        debug!(session_id = %response.session_id, path = %transport_path, "Opening transport");
        let mut generations = self.generation.subscribe();
        let timeout = self.options.handshake_timeout;
        let credentials = self.credentials.clone();
        let opened = tokio::select! {
            biased;
            _ = superseded(&mut generations, generation) => Err(EstablishError::Stale),
            result = async {
                transport.connect(endpoint.as_str(), credentials).await?;
                transport.wait_connected(timeout).await
            } => result.map_err(EstablishError::from),
        };
        if let Err(e) = opened {
            transport.disconnect();
            return Err(e);
        }

        {
            let mut binding = lock(&self.binding);
            if !self.is_current(generation) {
                drop(binding);
                transport.disconnect();
                return Err(EstablishError::Stale);
            }
            if let Some(mut leftover) = binding.transport.replace(transport) {
                leftover.disconnect();
            }
            binding.generation = generation;
            binding.session_id = Some(response.session_id.clone());
            binding.provider = Some(provider);
        }

        let now = Utc::now();
        {
            let mut metadata = self.write_metadata();
            metadata.created_at = Some(now);
            metadata.last_activity_at = Some(now);
            metadata.endpoint = Some(endpoint.to_string());
            metadata.transport_path = Some(transport_path.clone());
        }
        let session_id = response.session_id.clone();
        self.update_current(generation, |s| {
            s.status = ConnectionState::Connected;
            s.provider = provider;
            s.session_id = Some(session_id);
            if let Some(call) = s.call.as_mut() {
                call.provider = provider;
                call.activate();
            }
            s.last_event = Some("connected".to_string());
        });
        info!(
            session_id = %response.session_id,
            provider = %provider,
            path = %transport_path,
            generation,
            "Session connected"
        );

        // Whatever the transport reported while connecting, including the `Connected`
        // that triggers the config envelope.
        while let Ok(event) = events_rx.try_recv() {
            self.handle_transport_event(generation, event);
        }
        tokio::spawn(run_transport_events(
            Arc::downgrade(self),
            generation,
            events_rx,
            self.generation.subscribe(),
        ));

        let bootstrap = self.bootstrap.clone();
        let session_id = response.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = bootstrap.start_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Session start notice failed");
            }
        });
        Ok(())
    }

    fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.on_state_changed(generation, state),
            TransportEvent::Message(message) => self.on_message(generation, message),
            TransportEvent::Audio(data) => self.play_downlink(&data),
            TransportEvent::Quality(mut quality) => {
                quality.audio_level = lock(&self.capture).level();
                self.store.set_quality(quality);
            }
            TransportEvent::Error(error) => {
                if self.is_current(generation) {
                    self.store.record_error(&error, default_recovery(&error));
                }
            }
        }
    }

    fn on_state_changed(&self, generation: u64, reported: ConnectionState) {
        let current = {
            let binding = lock(&self.binding);
            if binding.generation != generation {
                return;
            }
            match binding.transport.as_ref() {
                Some(transport) => transport.state(),
                None => return,
            }
        };
        // Only the latest state is applied; earlier reports still in the queue are skipped.
        if reported != current {
            debug!(%reported, %current, "Skipping outdated state report");
            return;
        }

        match current {
            ConnectionState::Idle => {}
            ConnectionState::Connected => {
                self.update_current(generation, |s| {
                    s.status = ConnectionState::Connected;
                    if let Some(call) = s.call.as_mut() {
                        call.activate();
                    }
                    s.last_event = Some("connected".to_string());
                });
                self.send_config(generation);
            }
            ConnectionState::Failed => self.mark_failed(generation),
            other => {
                self.update_current(generation, |s| {
                    s.status = other;
                    s.last_event = Some(other.to_string());
                });
            }
        }
    }

    /// Send the session settings on a fresh connection.
    fn send_config(&self, generation: u64) {
        let metadata = self.read_metadata().clone();
        let binding = lock(&self.binding);
        if binding.generation != generation {
            return;
        }
        let (Some(transport), Some(session_id)) = (binding.transport.as_ref(), binding.session_id.clone()) else {
            return;
        };
        let config = OutboundMessage::Config(SessionSettings {
            session_id,
            instructions: metadata.instructions,
            target: metadata.target,
            direction: metadata.direction,
            input_format: self.options.uplink,
            output_format: self.options.downlink,
        });
        if !transport.send_message(&config) {
            warn!(generation, "Session config could not be sent");
        }
    }

    fn on_message(&self, generation: u64, message: InboundMessage) {
        if !self.is_current(generation) {
            return;
        }
        self.touch();
        let (label, event) = match message {
            InboundMessage::Transcription(t) => ("transcription", SessionEvent::Transcription(t)),
            InboundMessage::Sentiment(s) => ("sentiment", SessionEvent::Sentiment(s)),
            InboundMessage::FunctionCall(call) => ("function_call", SessionEvent::FunctionCall(call)),
            InboundMessage::Error(e) => {
                warn!(code = ?e.code, message = %e.message, "Provider reported an error");
                ("provider_error", SessionEvent::ProviderError(e))
            }
            InboundMessage::Audio(payload) => {
                match payload.decode() {
                    Some(data) => self.play_downlink(&data),
                    None => warn!("Dropping audio envelope with invalid base64"),
                }
                return;
            }
            InboundMessage::Pong(_) => return,
        };
        self.update_current(generation, |s| s.last_event = Some(label.to_string()));
        self.store.publish(event);
    }

    fn play_downlink(&self, data: &[u8]) {
        let result = lock(&self.playback).play_wire(data, &self.options.downlink);
        if let Err(e) = result {
            self.counters.playback_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, bytes = data.len(), "Dropping undecodable downlink audio");
        }
    }

    fn send_frame(&self, frame: AudioFrame) {
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        let encoded = match encode_for_wire(&frame.samples, frame.sample_rate, frame.channels, &self.options.uplink) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(sequence = frame.sequence, error = %e, "Dropping frame that cannot be encoded");
                return;
            }
        };
        let binding = lock(&self.binding);
        match binding.transport.as_ref() {
            Some(transport) if transport.state() == ConnectionState::Connected => {
                if transport.send_audio(&encoded, frame.sequence) {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn run_transport_events(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut generations: watch::Receiver<u64>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = superseded(&mut generations, generation) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_transport_event(generation, event);
    }
    debug!(generation, "Transport event pump stopped");
}

async fn run_uplink(inner: Weak<Inner>, mut frames: FrameReceiver) {
    while let Some(frame) = frames.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.send_frame(frame);
    }
    debug!("Uplink stopped");
}

async fn run_device_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<CaptureEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            CaptureEvent::DeviceLost(reason) => {
                warn!(reason = %reason, "Capture device lost");
                let error = VoiceError::AudioDevice(reason);
                inner
                    .store
                    .record_error(&error, Some(RecoveryAction::RequestMicrophone));
            }
        }
    }
}

async fn run_level_meter(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let input = lock(&inner.capture).level();
        let output = lock(&inner.playback).level();
        inner.store.publish(SessionEvent::AudioLevel { input, output });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::webrtc::testing::{FakeConnector, FakeEngine, FakeSignaling};
    use crate::transport::ReconnectPolicy;
    use futures_util::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    /// Bootstrap with per-provider latency; "broken" providers get an endpoint the fake
    /// signaling rejects.
    #[derive(Default)]
    struct ScriptedBootstrap {
        delays: HashMap<Provider, Duration>,
        broken: Mutex<Vec<Provider>>,
        created: Mutex<Vec<(Provider, String)>>,
        ended: Mutex<Vec<String>>,
        next_id: AtomicU32,
    }

    impl ScriptedBootstrap {
        fn session_of(&self, provider: Provider) -> Vec<String> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == provider)
                .map(|(_, id)| id.clone())
                .collect()
        }
    }

    impl SessionBootstrap for ScriptedBootstrap {
        fn create_session(&self, request: BootstrapRequest) -> BoxFuture<'_, VoiceResult<BootstrapResponse>> {
            Box::pin(async move {
                if let Some(delay) = self.delays.get(&request.provider) {
                    tokio::time::sleep(*delay).await;
                }
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let session_id = format!("{}-{}", request.provider, n);
                let host = if self.broken.lock().unwrap().contains(&request.provider) {
                    "broken.test"
                } else {
                    "voice.test"
                };
                self.created.lock().unwrap().push((request.provider, session_id.clone()));
                Ok(BootstrapResponse {
                    websocket_url: format!("wss://{}/ws/{}?x=1", host, session_id),
                    session_id,
                    metadata: serde_json::Value::Null,
                })
            })
        }

        fn start_session<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
            Box::pin(async move { Ok(()) })
        }

        fn end_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
            Box::pin(async move {
                self.ended.lock().unwrap().push(session_id.to_string());
                Ok(())
            })
        }
    }

    fn manager(bootstrap: Arc<ScriptedBootstrap>) -> (SessionManager, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::default());
        let options = SessionOptions {
            transport: TransportKind::WebRtc,
            handshake_timeout: Duration::from_secs(2),
            transport_settings: TransportSettings {
                reconnect: ReconnectPolicy {
                    enabled: true,
                    base_delay_ms: 5,
                    max_delay_ms: 20,
                    max_attempts: 2,
                },
                handshake_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = SessionManager::builder(options, bootstrap)
            .peer_engine(Arc::new(FakeConnector(engine.clone())), Arc::new(FakeSignaling))
            .build()
            .unwrap();
        (manager, engine)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_connect_binds_session_and_is_idempotent() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let (manager, engine) = manager(bootstrap.clone());

        manager.connect().await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionState::Connected);
        assert_eq!(snapshot.session_id.as_deref(), Some("provider_a-1"));
        assert_eq!(snapshot.call.as_ref().unwrap().status, CallStatus::Active);
        assert_eq!(manager.metadata().transport_path.as_deref(), Some("/ws/provider_a-1?x=1"));

        manager.connect().await.unwrap();
        assert_eq!(bootstrap.created.lock().unwrap().len(), 1);
        assert_eq!(engine.peers_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rapid_switch_keeps_only_latest_provider() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            delays: HashMap::from([(Provider::ProviderB, Duration::from_millis(200))]),
            ..Default::default()
        });
        let (manager, engine) = manager(bootstrap.clone());
        manager.connect().await.unwrap();
        let call_id = manager.snapshot().call.unwrap().id;

        let to_b = manager.clone();
        let slow = tokio::spawn(async move { to_b.switch_provider(Provider::ProviderB).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.switch_provider(Provider::ProviderC).await.unwrap();
        slow.await.unwrap().unwrap();
        settle().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.provider, Provider::ProviderC);
        assert_eq!(snapshot.status, ConnectionState::Connected);
        assert!(snapshot.session_id.unwrap().starts_with("provider_c"));
        let call = snapshot.call.unwrap();
        assert_eq!(call.id, call_id);
        assert_eq!(call.provider, Provider::ProviderC);

        // B's session was created late and ended without ever getting a peer.
        let b_sessions = bootstrap.session_of(Provider::ProviderB);
        assert_eq!(b_sessions.len(), 1);
        assert!(bootstrap.ended.lock().unwrap().contains(&b_sessions[0]));
        assert_eq!(engine.peers_created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_switch_restores_previous_provider() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            broken: Mutex::new(vec![Provider::ProviderB]),
            ..Default::default()
        });
        let (manager, _engine) = manager(bootstrap);
        manager.connect().await.unwrap();
        let call_id = manager.snapshot().call.unwrap().id;

        let result = manager.switch_provider(Provider::ProviderB).await;
        assert!(matches!(result, Err(VoiceError::ProviderSwitch { rolled_back: true, .. })));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.provider, Provider::ProviderA);
        assert_eq!(snapshot.status, ConnectionState::Connected);
        let call = snapshot.call.unwrap();
        assert_eq!(call.id, call_id);
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(manager.store().errors().last().unwrap().code, "provider_switch_error");
    }

    #[tokio::test]
    async fn test_failed_switch_without_restore_marks_call_error() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            broken: Mutex::new(vec![Provider::ProviderB]),
            ..Default::default()
        });
        let (manager, _engine) = manager(bootstrap.clone());
        manager.connect().await.unwrap();
        let call_id = manager.snapshot().call.unwrap().id;
        bootstrap.broken.lock().unwrap().push(Provider::ProviderA);

        let result = manager.switch_provider(Provider::ProviderB).await;
        assert!(matches!(result, Err(VoiceError::ProviderSwitch { rolled_back: false, .. })));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionState::Failed);
        assert_eq!(snapshot.provider, Provider::ProviderA);
        let call = snapshot.call.unwrap();
        assert_eq!(call.id, call_id);
        assert_eq!(call.status, CallStatus::Error);

        let record = manager.store().errors().pop().unwrap();
        assert_eq!(record.code, "provider_switch_error");
        assert_eq!(
            record.recovery,
            Some(RecoveryAction::RestoreProvider {
                provider: Provider::ProviderA
            })
        );
    }

    #[tokio::test]
    async fn test_failed_call_is_archived_on_next_connect() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            broken: Mutex::new(vec![Provider::ProviderA]),
            ..Default::default()
        });
        let (manager, _engine) = manager(bootstrap);
        assert!(manager.connect().await.is_err());
        let failed = manager.snapshot().call.unwrap();
        assert_eq!(failed.status, CallStatus::Error);
        assert!(manager.store().history().is_empty());

        manager.set_provider(Provider::ProviderB).unwrap();
        manager.connect().await.unwrap();

        let history = manager.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, failed.id);
        assert_eq!(history[0].status, CallStatus::Error);
        assert!(history[0].end_time.is_some());
        let current = manager.snapshot().call.unwrap();
        assert_ne!(current.id, failed.id);
        assert_eq!(current.status, CallStatus::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_connects_bootstrap_once() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            delays: HashMap::from([(Provider::ProviderA, Duration::from_millis(50))]),
            ..Default::default()
        });
        let (manager, engine) = manager(bootstrap.clone());

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        settle().await;

        assert_eq!(manager.snapshot().status, ConnectionState::Connected);
        assert_eq!(bootstrap.created.lock().unwrap().len(), 1);
        assert_eq!(engine.peers_created.load(Ordering::SeqCst), 1);
        assert!(bootstrap.ended.lock().unwrap().is_empty());
        assert!(manager.store().history().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_archives_call_and_ends_session() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let (manager, _engine) = manager(bootstrap.clone());
        manager.connect().await.unwrap();

        manager.disconnect();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, ConnectionState::Idle);
        assert!(snapshot.session_id.is_none());
        assert!(snapshot.call.is_none());

        let history = manager.store().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallStatus::Ended);

        settle().await;
        assert_eq!(*bootstrap.ended.lock().unwrap(), vec!["provider_a-1".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_abandons_pending_connect() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            delays: HashMap::from([(Provider::ProviderA, Duration::from_millis(100))]),
            ..Default::default()
        });
        let (manager, engine) = manager(bootstrap.clone());

        let connecting = manager.clone();
        let pending = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.disconnect();
        pending.await.unwrap().unwrap();
        settle().await;

        assert_eq!(manager.snapshot().status, ConnectionState::Idle);
        assert_eq!(engine.peers_created.load(Ordering::SeqCst), 0);
        assert_eq!(*bootstrap.ended.lock().unwrap(), vec!["provider_a-1".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_while_idle_only_selects_provider() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let (manager, _engine) = manager(bootstrap.clone());
        manager.switch_provider(Provider::ProviderB).await.unwrap();
        assert_eq!(manager.provider(), Provider::ProviderB);
        assert_eq!(manager.snapshot().status, ConnectionState::Idle);
        assert!(bootstrap.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_microphone_is_logged_with_recovery() {
        let (manager, _engine) = manager(Arc::new(ScriptedBootstrap::default()));
        let result = manager.start_audio();
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));

        let record = manager.store().errors().pop().unwrap();
        assert_eq!(record.recovery, Some(RecoveryAction::RequestMicrophone));
        assert_eq!(manager.stats().frames_captured, 0);
        assert!(manager.recover(Uuid::new_v4()).await.is_err());
    }

    #[test]
    fn test_webrtc_requires_peer_engine() {
        let options = SessionOptions {
            transport: TransportKind::WebRtc,
            ..Default::default()
        };
        let result = SessionManager::builder(options, Arc::new(ScriptedBootstrap::default())).build();
        assert!(matches!(result, Err(VoiceError::Configuration(_))));
    }
}

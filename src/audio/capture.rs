//! # Capture Engine
//!
//! Turns whatever block sizes a device delivers into fixed-duration [`AudioFrame`]s and
//! hands them to a registered consumer.
//!
//! ## Threads:
//! - **Device thread**: owns the [`FrameSink`], accumulates samples, cuts frames and
//!   invokes the consumer. Nothing here locks, logs or parses.
//! - **Async side**: owns the [`CaptureEngine`], receives [`CaptureEvent`]s and the frames
//!   forwarded through [`frame_handoff`].
//!
//! ## Lifecycle:
//! 1. `set_consumer` registers the callback (usually the sender half of a hand-off)
//! 2. `start_capture` opens the device; failures surface synchronously
//! 3. `stop_capture` releases the device and flushes the partial frame; idempotent
//!
//! Device loss is reported once as [`CaptureEvent::DeviceLost`]. The engine never
//! reopens the device by itself.

use crate::audio::device::{AudioInput, CaptureConstraints};
use crate::audio::frame::AudioFrame;
use crate::audio::level::LevelMeter;
use crate::error::{VoiceError, VoiceResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Callback run on the device thread for every finished frame. Must not block.
pub type FrameConsumer = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Notifications from the device thread, delivered to the async side.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    DeviceLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Idle,
    Capturing,
    /// The device went away mid-capture; `stop_capture` or `start_capture` clears it.
    Faulted,
}

/// State shared between one capture session's sink and the engine.
#[derive(Debug)]
struct CaptureShared {
    active: AtomicBool,
    faulted: AtomicBool,
    frames_produced: AtomicU64,
    level: LevelMeter,
}

impl CaptureShared {
    fn new(level_smoothing: f32) -> Self {
        Self {
            active: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
            frames_produced: AtomicU64::new(0),
            level: LevelMeter::new(level_smoothing),
        }
    }
}

/// Device-side end of a capture session.
///
/// Owned by the device thread. Dropping it flushes any partial frame, which is how
/// `stop_capture` delivers the tail of the recording.
pub struct FrameSink {
    pending: Vec<i16>,
    frame_len: usize,
    sample_rate: u32,
    channels: u16,
    sequence: u64,
    consumer: FrameConsumer,
    shared: Arc<CaptureShared>,
    events: Option<mpsc::UnboundedSender<CaptureEvent>>,
}

impl FrameSink {
    fn new(
        constraints: &CaptureConstraints,
        frame_duration_ms: u32,
        consumer: FrameConsumer,
        shared: Arc<CaptureShared>,
        events: Option<mpsc::UnboundedSender<CaptureEvent>>,
    ) -> Self {
        let per_channel = (constraints.sample_rate as u64 * frame_duration_ms as u64 / 1000).max(1) as usize;
        let frame_len = per_channel * constraints.channels as usize;
        Self {
            pending: Vec::with_capacity(frame_len),
            frame_len,
            sample_rate: constraints.sample_rate,
            channels: constraints.channels,
            sequence: 0,
            consumer,
            shared,
            events,
        }
    }

    /// Interleaved samples per full frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Feed one device block of interleaved samples.
    pub fn push(&mut self, block: &[i16]) {
        if !self.shared.active.load(Ordering::Acquire) {
            return;
        }
        self.shared.level.observe(block);

        let mut rest = block;
        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_len {
                self.emit();
            }
        }
    }

    /// Report that the device disappeared. Later pushes are ignored.
    pub fn device_lost(&mut self, reason: impl Into<String>) {
        if self.shared.active.swap(false, Ordering::AcqRel) {
            self.shared.faulted.store(true, Ordering::Release);
            self.pending.clear();
            if let Some(events) = &self.events {
                let _ = events.send(CaptureEvent::DeviceLost(reason.into()));
            }
        }
    }

    fn emit(&mut self) {
        let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
        let frame = AudioFrame::new(samples, self.sample_rate, self.channels, self.sequence);
        self.sequence += 1;
        self.shared.frames_produced.fetch_add(1, Ordering::Relaxed);
        (self.consumer)(frame);
    }

    fn flush(&mut self) {
        if !self.shared.active.load(Ordering::Acquire) {
            return;
        }
        // Only whole sample frames leave the sink.
        let whole = self.pending.len() - self.pending.len() % self.channels.max(1) as usize;
        self.pending.truncate(whole);
        if !self.pending.is_empty() {
            self.emit();
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(frame_duration_ms: u32) -> (Self, Arc<std::sync::Mutex<Vec<AudioFrame>>>) {
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_target = collected.clone();
        let consumer: FrameConsumer = Arc::new(move |frame: AudioFrame| {
            sink_target.lock().unwrap().push(frame);
        });
        let sink = Self::new(
            &CaptureConstraints::default(),
            frame_duration_ms,
            consumer,
            Arc::new(CaptureShared::new(1.0)),
            None,
        );
        (sink, collected)
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Receiving half of the audio-thread hand-off.
pub struct FrameReceiver {
    rx: mpsc::Receiver<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared handle on the drop counter, for metrics.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

/// Bounded single-producer/single-consumer FIFO between the device thread and the network.
///
/// The producer side never waits: when the queue is full the newest frame is dropped and
/// counted. Frames leave in capture order.
pub fn frame_handoff(capacity: usize) -> (FrameConsumer, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let counter = dropped.clone();
    let consumer: FrameConsumer = Arc::new(move |frame: AudioFrame| {
        if tx.try_send(frame).is_err() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });
    (consumer, FrameReceiver { rx, dropped })
}

/// Microphone capture engine. Singly owns its input device.
pub struct CaptureEngine {
    input: Box<dyn AudioInput>,
    frame_duration_ms: u32,
    level_smoothing: f32,
    consumer: Option<FrameConsumer>,
    events: Option<mpsc::UnboundedSender<CaptureEvent>>,
    session: Option<Arc<CaptureShared>>,
}

impl CaptureEngine {
    pub fn new(input: Box<dyn AudioInput>, frame_duration_ms: u32, level_smoothing: f32) -> Self {
        Self {
            input,
            frame_duration_ms: frame_duration_ms.max(1),
            level_smoothing,
            consumer: None,
            events: None,
            session: None,
        }
    }

    /// Register the frame callback used by subsequent captures.
    pub fn set_consumer(&mut self, consumer: FrameConsumer) {
        self.consumer = Some(consumer);
    }

    /// Forget the frame callback. Once the device has released its sink this closes the
    /// hand-off, so the receiving side sees the end of the stream.
    pub fn clear_consumer(&mut self) {
        self.consumer = None;
    }

    /// Receive device notifications. Replaces any earlier subscription.
    pub fn subscribe_events(&mut self) -> mpsc::UnboundedReceiver<CaptureEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn device_name(&self) -> &str {
        self.input.name()
    }

    pub fn status(&self) -> CaptureStatus {
        match &self.session {
            None => CaptureStatus::Idle,
            Some(shared) if shared.faulted.load(Ordering::Acquire) => CaptureStatus::Faulted,
            Some(_) => CaptureStatus::Capturing,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.status() == CaptureStatus::Capturing
    }

    /// Smoothed input level of the current capture, 0.0 when idle.
    pub fn level(&self) -> f32 {
        self.session.as_ref().map(|s| s.level.level()).unwrap_or(0.0)
    }

    pub fn frames_produced(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.frames_produced.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Open the device and start producing frames.
    ///
    /// Returns `PermissionDenied` / `DeviceUnavailable` from the device unchanged; in that
    /// case the consumer is never called. Calling it while already capturing is a no-op.
    pub fn start_capture(&mut self, constraints: &CaptureConstraints) -> VoiceResult<()> {
        match self.status() {
            CaptureStatus::Capturing => {
                debug!(device = %self.input.name(), "Capture already running");
                return Ok(());
            }
            CaptureStatus::Faulted => self.stop_capture(),
            CaptureStatus::Idle => {}
        }

        constraints.validate()?;
        let consumer = self
            .consumer
            .clone()
            .ok_or_else(|| VoiceError::configuration("no frame consumer registered"))?;

        let shared = Arc::new(CaptureShared::new(self.level_smoothing));
        let sink = FrameSink::new(
            constraints,
            self.frame_duration_ms,
            consumer,
            shared.clone(),
            self.events.clone(),
        );

        if let Err(e) = self.input.open(constraints, sink) {
            warn!(device = %self.input.name(), error = %e, "Failed to open capture device");
            shared.active.store(false, Ordering::Release);
            return Err(e);
        }

        info!(
            device = %self.input.name(),
            sample_rate = constraints.sample_rate,
            channels = constraints.channels,
            frame_ms = self.frame_duration_ms,
            "Capture started"
        );
        self.session = Some(shared);
        Ok(())
    }

    /// Release the device and flush the pending partial frame. Safe to call repeatedly.
    pub fn stop_capture(&mut self) {
        let Some(shared) = self.session.take() else {
            return;
        };
        // Closing drops the sink, which flushes while the session is still active.
        self.input.close();
        shared.active.store(false, Ordering::Release);
        info!(
            device = %self.input.name(),
            frames = shared.frames_produced.load(Ordering::Relaxed),
            "Capture stopped"
        );
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Input driven directly by the test instead of a device thread.
    struct ScriptedInput {
        deny: bool,
        sink: Arc<Mutex<Option<FrameSink>>>,
    }

    impl ScriptedInput {
        fn new(deny: bool) -> (Self, Arc<Mutex<Option<FrameSink>>>) {
            let sink = Arc::new(Mutex::new(None));
            (
                Self {
                    deny,
                    sink: sink.clone(),
                },
                sink,
            )
        }
    }

    impl AudioInput for ScriptedInput {
        fn open(&mut self, _constraints: &CaptureConstraints, sink: FrameSink) -> VoiceResult<()> {
            if self.deny {
                return Err(VoiceError::PermissionDenied("user dismissed the prompt".into()));
            }
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn close(&mut self) {
            self.sink.lock().unwrap().take();
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn collecting_consumer() -> (FrameConsumer, Arc<Mutex<Vec<AudioFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let target = frames.clone();
        (Arc::new(move |f: AudioFrame| target.lock().unwrap().push(f)), frames)
    }

    fn push(handle: &Arc<Mutex<Option<FrameSink>>>, samples: &[i16]) {
        handle.lock().unwrap().as_mut().unwrap().push(samples);
    }

    #[test]
    fn test_permission_denied_produces_no_frames() {
        let (input, _handle) = ScriptedInput::new(true);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 0.3);
        let (consumer, frames) = collecting_consumer();
        engine.set_consumer(consumer);

        let err = engine.start_capture(&CaptureConstraints::default()).unwrap_err();
        assert!(matches!(err, VoiceError::PermissionDenied(_)));
        assert_eq!(engine.status(), CaptureStatus::Idle);
        engine.stop_capture();
        assert!(frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_frames_are_cut_to_fixed_size_in_order() {
        let (input, handle) = ScriptedInput::new(false);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 0.3);
        let (consumer, frames) = collecting_consumer();
        engine.set_consumer(consumer);
        engine.start_capture(&CaptureConstraints::default()).unwrap();

        // 16 kHz * 20 ms = 320 samples per frame; feed 128-sample quanta.
        for _ in 0..5 {
            push(&handle, &[100; 128]);
        }
        let collected = frames.lock().unwrap();
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(|f| f.samples.len() == 320));
        assert_eq!(collected[0].sequence, 0);
        assert_eq!(collected[1].sequence, 1);
        assert_eq!(engine.frames_produced(), 2);
    }

    #[test]
    fn test_stop_flushes_partial_frame_and_is_idempotent() {
        let (input, handle) = ScriptedInput::new(false);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 0.3);
        let (consumer, frames) = collecting_consumer();
        engine.set_consumer(consumer);
        engine.start_capture(&CaptureConstraints::default()).unwrap();

        push(&handle, &[1; 400]);
        engine.stop_capture();
        engine.stop_capture();

        let collected = frames.lock().unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[1].samples.len(), 80);
        assert_eq!(engine.status(), CaptureStatus::Idle);
    }

    #[test]
    fn test_start_without_consumer_is_configuration_error() {
        let (input, _handle) = ScriptedInput::new(false);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 0.3);
        let err = engine.start_capture(&CaptureConstraints::default()).unwrap_err();
        assert!(matches!(err, VoiceError::Configuration(_)));
    }

    #[test]
    fn test_device_loss_is_reported_once_and_not_retried() {
        let (input, handle) = ScriptedInput::new(false);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 0.3);
        let (consumer, frames) = collecting_consumer();
        engine.set_consumer(consumer);
        let mut events = engine.subscribe_events();
        engine.start_capture(&CaptureConstraints::default()).unwrap();

        {
            let mut guard = handle.lock().unwrap();
            let sink = guard.as_mut().unwrap();
            sink.push(&[5; 100]);
            sink.device_lost("unplugged");
            sink.device_lost("unplugged again");
            sink.push(&[5; 1000]);
        }

        assert_eq!(engine.status(), CaptureStatus::Faulted);
        assert_eq!(events.try_recv().unwrap(), CaptureEvent::DeviceLost("unplugged".into()));
        assert!(events.try_recv().is_err());
        assert!(frames.lock().unwrap().is_empty());

        engine.stop_capture();
        assert!(frames.lock().unwrap().is_empty());
        assert_eq!(engine.status(), CaptureStatus::Idle);
    }

    #[test]
    fn test_handoff_is_fifo_and_counts_drops() {
        let (consumer, mut receiver) = frame_handoff(2);
        for seq in 0..4 {
            consumer(AudioFrame::new(vec![0; 4], 16_000, 1, seq));
        }
        assert_eq!(receiver.try_recv().unwrap().sequence, 0);
        assert_eq!(receiver.try_recv().unwrap().sequence, 1);
        assert!(receiver.try_recv().is_none());
        assert_eq!(receiver.dropped(), 2);
    }

    #[test]
    fn test_level_tracks_input() {
        let (input, handle) = ScriptedInput::new(false);
        let mut engine = CaptureEngine::new(Box::new(input), 20, 1.0);
        let (consumer, _frames) = collecting_consumer();
        engine.set_consumer(consumer);
        assert_eq!(engine.level(), 0.0);
        engine.start_capture(&CaptureConstraints::default()).unwrap();
        push(&handle, &[16_384; 128]);
        assert!((engine.level() - 0.5).abs() < 0.01);
    }
}

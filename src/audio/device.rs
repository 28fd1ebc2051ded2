//! # Audio Device Seams
//!
//! The capture and playback engines never touch a platform audio API directly. They talk
//! to these two traits, which a host (browser bridge, native backend, test harness)
//! implements for its own devices.
//!
//! ## Provided Devices:
//! - **WavFileInput**: plays a WAV file into the capture engine from its own thread,
//!   paced like a real microphone (used by the daemon and for offline runs)
//! - **UnavailableInput**: stands in when no capture device is configured
//! - **VirtualOutput**: an output clock that can record everything scheduled on it
//!   and write it to a WAV file afterwards
//!
//! ## Threading Contract:
//! `AudioInput::open` hands a [`FrameSink`] to the device. The device pushes samples
//! into it from its real-time thread and must drop it before `close` returns.

use crate::audio::capture::FrameSink;
use crate::audio::format;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Samples delivered per device callback, per channel (one render quantum).
pub const RENDER_QUANTUM: usize = 128;

/// Requested capture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Preferred device; `None` selects the default input.
    pub device_id: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

impl CaptureConstraints {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::configuration("capture sample rate must be greater than 0"));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(VoiceError::configuration(format!(
                "capture supports 1 or 2 channels, got {}",
                self.channels
            )));
        }
        Ok(())
    }
}

/// A microphone-like source.
pub trait AudioInput: Send {
    /// Acquire the device and start pushing samples into `sink` from the device thread.
    ///
    /// Fails with `PermissionDenied` or `DeviceUnavailable` without ever touching `sink`.
    fn open(&mut self, constraints: &CaptureConstraints, sink: FrameSink) -> VoiceResult<()>;

    /// Release the device. Must be idempotent and must drop the sink before returning.
    fn close(&mut self);

    fn name(&self) -> &str;
}

/// A speaker-like sink with its own clock.
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    /// Current output clock position in seconds.
    fn current_time(&self) -> f64;

    /// Queue mono samples to start at `start_time` seconds on the output clock.
    fn schedule(&mut self, start_time: f64, samples: &[i16]) -> VoiceResult<()>;

    /// Drop everything queued but not yet played.
    fn cancel(&mut self) {}

    /// Finish any pending output work; called once at shutdown.
    fn flush(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Input used when no capture device is configured.
#[derive(Debug, Default)]
pub struct UnavailableInput;

impl AudioInput for UnavailableInput {
    fn open(&mut self, _constraints: &CaptureConstraints, _sink: FrameSink) -> VoiceResult<()> {
        Err(VoiceError::DeviceUnavailable("no capture device configured".to_string()))
    }

    fn close(&mut self) {}

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Microphone backed by a WAV file, paced in real time on a dedicated thread.
pub struct WavFileInput {
    path: PathBuf,
    looping: bool,
    realtime: bool,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl WavFileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("wav:{}", path.display());
        Self {
            path,
            looping: false,
            realtime: true,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            name,
        }
    }

    /// Restart from the beginning at end of file instead of stopping.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Deliver as fast as possible instead of at wall-clock pace.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }
}

impl AudioInput for WavFileInput {
    fn open(&mut self, constraints: &CaptureConstraints, mut sink: FrameSink) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Err(VoiceError::DeviceUnavailable(format!("{} is already open", self.name)));
        }
        let samples = load_wav_as(&self.path, constraints.sample_rate, constraints.channels)?;
        if samples.is_empty() {
            return Err(VoiceError::DeviceUnavailable(format!("{} contains no audio", self.name)));
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let looping = self.looping;
        let quantum = RENDER_QUANTUM * constraints.channels as usize;
        let pace = if self.realtime {
            Some(Duration::from_secs_f64(RENDER_QUANTUM as f64 / constraints.sample_rate as f64))
        } else {
            None
        };

        let worker = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut delivered: u32 = 0;
                loop {
                    for block in samples.chunks(quantum) {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        sink.push(block);
                        if let Some(period) = pace {
                            delivered += 1;
                            let due = period * delivered;
                            if let Some(wait) = due.checked_sub(started.elapsed()) {
                                std::thread::sleep(wait);
                            }
                        }
                    }
                    if !looping {
                        return;
                    }
                }
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("failed to start capture thread: {}", e)))?;

        info!(device = %self.name, sample_rate = constraints.sample_rate, "WAV capture device opened");
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(device = %self.name, "capture thread panicked");
            }
            debug!(device = %self.name, "WAV capture device closed");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WavFileInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read a WAV file and convert it to interleaved PCM16 at the requested rate and layout.
pub fn load_wav_as(path: &Path, sample_rate: u32, channels: u16) -> VoiceResult<Vec<i16>> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot open {}: {}", path.display(), e)))?;
    let (header, data) = wav::read(&mut file)
        .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot decode {}: {}", path.display(), e)))?;

    let interleaved: Vec<i16> = match data {
        wav::BitDepth::Eight(values) => values.iter().map(|&v| ((v as i16) - 128) << 8).collect(),
        wav::BitDepth::Sixteen(values) => values,
        wav::BitDepth::TwentyFour(values) => values.iter().map(|&v| (v >> 8) as i16).collect(),
        wav::BitDepth::ThirtyTwoFloat(values) => values
            .iter()
            .map(|&v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect(),
        wav::BitDepth::Empty => Vec::new(),
    };

    let mono = match (header.channel_count, channels) {
        (1, _) => interleaved,
        (2, 1) => format::downmix_samples(&interleaved),
        (2, 2) => {
            return Ok(if header.sampling_rate == sample_rate {
                interleaved
            } else {
                let left: Vec<i16> = interleaved.iter().step_by(2).copied().collect();
                let right: Vec<i16> = interleaved.iter().skip(1).step_by(2).copied().collect();
                let left = format::resample_samples(&left, header.sampling_rate, sample_rate)?;
                let right = format::resample_samples(&right, header.sampling_rate, sample_rate)?;
                left.iter().zip(right.iter()).flat_map(|(&l, &r)| [l, r]).collect()
            });
        }
        (other, _) => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "{} has {} channels, only mono and stereo files are supported",
                path.display(),
                other
            )))
        }
    };

    let resampled = format::resample_samples(&mono, header.sampling_rate, sample_rate)?;
    Ok(if channels == 2 {
        resampled.iter().flat_map(|&s| [s, s]).collect()
    } else {
        resampled
    })
}

/// Where a [`VirtualOutput`] reads its clock from.
#[derive(Debug, Clone)]
enum OutputClock {
    Realtime(Instant),
    Manual(Arc<AtomicU64>),
}

/// Handle for advancing a manually clocked [`VirtualOutput`].
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn set(&self, seconds: f64) {
        self.micros.store((seconds.max(0.0) * 1_000_000.0) as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.micros
            .fetch_add((seconds.max(0.0) * 1_000_000.0) as u64, Ordering::SeqCst);
    }
}

/// Output device with a virtual clock. Optionally records the scheduled timeline.
pub struct VirtualOutput {
    sample_rate: u32,
    clock: OutputClock,
    recording: Option<Vec<i16>>,
    record_path: Option<PathBuf>,
    samples_scheduled: u64,
}

impl VirtualOutput {
    /// Output whose clock follows wall time from construction.
    pub fn realtime(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clock: OutputClock::Realtime(Instant::now()),
            recording: None,
            record_path: None,
            samples_scheduled: 0,
        }
    }

    /// Output whose clock only moves when the returned handle advances it.
    pub fn manual(sample_rate: u32) -> (Self, ManualClock) {
        let micros = Arc::new(AtomicU64::new(0));
        let output = Self {
            sample_rate,
            clock: OutputClock::Manual(micros.clone()),
            recording: None,
            record_path: None,
            samples_scheduled: 0,
        };
        (output, ManualClock { micros })
    }

    /// Keep every scheduled sample at its timeline position.
    pub fn with_recording(mut self) -> Self {
        self.recording = Some(Vec::new());
        self
    }

    /// Record and write the timeline to `path` when the output is flushed.
    pub fn record_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.recording = Some(Vec::new());
        self.record_path = Some(path.into());
        self
    }

    pub fn samples_scheduled(&self) -> u64 {
        self.samples_scheduled
    }

    pub fn recording(&self) -> Option<&[i16]> {
        self.recording.as_deref()
    }

    /// Write the recorded timeline as a mono PCM16 WAV file.
    pub fn write_wav(&self, path: &Path) -> VoiceResult<()> {
        let Some(recording) = &self.recording else {
            return Err(VoiceError::configuration("output recording is not enabled"));
        };
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let mut file = std::fs::File::create(path)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot create {}: {}", path.display(), e)))?;
        wav::write(header, &wav::BitDepth::Sixteen(recording.clone()), &mut file)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot write {}: {}", path.display(), e)))?;
        info!(path = %path.display(), samples = recording.len(), "Playback recording written");
        Ok(())
    }
}

impl AudioOutput for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        match &self.clock {
            OutputClock::Realtime(started) => started.elapsed().as_secs_f64(),
            OutputClock::Manual(micros) => micros.load(Ordering::SeqCst) as f64 / 1_000_000.0,
        }
    }

    fn schedule(&mut self, start_time: f64, samples: &[i16]) -> VoiceResult<()> {
        self.samples_scheduled += samples.len() as u64;
        if let Some(recording) = self.recording.as_mut() {
            let offset = (start_time * self.sample_rate as f64).round() as usize;
            let end = offset + samples.len();
            if recording.len() < end {
                recording.resize(end, 0);
            }
            recording[offset..end].copy_from_slice(samples);
        }
        Ok(())
    }

    fn flush(&mut self) -> VoiceResult<()> {
        match self.record_path.clone() {
            Some(path) => self.write_wav(&path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_validation() {
        assert!(CaptureConstraints::default().validate().is_ok());
        let bad = CaptureConstraints {
            channels: 6,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(VoiceError::Configuration(_))));
    }

    #[test]
    fn test_manual_clock_drives_output_time() {
        let (output, clock) = VirtualOutput::manual(24_000);
        assert_eq!(output.current_time(), 0.0);
        clock.advance(0.25);
        assert!((output.current_time() - 0.25).abs() < 1e-9);
        clock.set(2.0);
        assert!((output.current_time() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_recording_places_samples_on_timeline() {
        let (output, _clock) = VirtualOutput::manual(1_000);
        let mut output = output.with_recording();
        output.schedule(0.002, &[7, 7]).unwrap();
        assert_eq!(output.recording().unwrap(), &[0, 0, 7, 7]);
        assert_eq!(output.samples_scheduled(), 2);
    }

    #[test]
    fn test_wav_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("voice-session-wav-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tone.wav");

        let (output, _clock) = VirtualOutput::manual(16_000);
        let mut output = output.with_recording();
        let tone: Vec<i16> = (0..1600).map(|i| ((i % 40) as i16 - 20) * 500).collect();
        output.schedule(0.0, &tone).unwrap();
        output.write_wav(&path).unwrap();

        let loaded = load_wav_as(&path, 16_000, 1).unwrap();
        assert_eq!(loaded, tone);
        let downsampled = load_wav_as(&path, 8_000, 1).unwrap();
        assert_eq!(downsampled.len(), 800);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unavailable_input_refuses_to_open() {
        let (sink, _probe) = FrameSink::detached(20);
        let mut input = UnavailableInput;
        let err = input.open(&CaptureConstraints::default(), sink).unwrap_err();
        assert!(matches!(err, VoiceError::DeviceUnavailable(_)));
    }
}

//! # Playback Scheduler
//!
//! Decodes inbound audio chunks and queues them back to back on the output clock.
//!
//! ## Scheduling Rule:
//! Every chunk starts at `max(end of previous chunk, current output time)`. Chunks that
//! arrive in a burst are laid end to end with no gap and no overlap; a chunk that arrives
//! after the queue has drained starts immediately. Chunks are never reordered.

use crate::audio::device::AudioOutput;
use crate::audio::format;
use crate::audio::frame::WireFormat;
use crate::audio::level::LevelMeter;
use crate::error::{FormatError, VoiceResult};
use serde::Serialize;
use tracing::debug;

/// Where a chunk landed on the output clock, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledChunk {
    pub start: f64,
    pub end: f64,
    /// Samples queued at the output rate.
    pub samples: usize,
}

impl ScheduledChunk {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Gapless playback engine. Singly owns its output device.
pub struct PlaybackEngine {
    output: Box<dyn AudioOutput>,
    next_start: f64,
    chunks_played: u64,
    level: LevelMeter,
}

impl PlaybackEngine {
    pub fn new(output: Box<dyn AudioOutput>, level_smoothing: f32) -> Self {
        Self {
            output,
            next_start: 0.0,
            chunks_played: 0,
            level: LevelMeter::new(level_smoothing),
        }
    }

    /// Schedule a PCM16 little-endian chunk.
    ///
    /// Stereo input is downmixed and everything is resampled to the output rate.
    pub fn play(&mut self, buffer: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<ScheduledChunk> {
        if channels == 0 || channels > 2 {
            return Err(FormatError::UnsupportedChannels(channels).into());
        }
        format::validate_stride(buffer, 2 * channels as usize)?;
        let samples = format::bytes_to_samples(buffer)?;
        self.play_samples(&samples, sample_rate, channels)
    }

    /// Schedule a chunk encoded in a session wire format.
    pub fn play_wire(&mut self, data: &[u8], wire: &WireFormat) -> VoiceResult<ScheduledChunk> {
        let samples = format::decode_from_wire(data, wire)?;
        self.play_samples(&samples, wire.sample_rate, wire.channels)
    }

    /// Schedule already decoded interleaved samples.
    pub fn play_samples(&mut self, samples: &[i16], sample_rate: u32, channels: u16) -> VoiceResult<ScheduledChunk> {
        let mono;
        let source: &[i16] = if channels == 2 {
            mono = format::downmix_samples(samples);
            &mono
        } else {
            samples
        };
        let output_rate = self.output.sample_rate();
        let resampled = format::resample_samples(source, sample_rate, output_rate)?;

        let now = self.output.current_time();
        let start = self.next_start.max(now);
        if resampled.is_empty() {
            return Ok(ScheduledChunk {
                start,
                end: start,
                samples: 0,
            });
        }

        let end = start + resampled.len() as f64 / output_rate as f64;
        self.output.schedule(start, &resampled)?;
        self.level.observe(&resampled);
        self.next_start = end;
        self.chunks_played += 1;

        debug!(start, end, samples = resampled.len(), "Scheduled playback chunk");
        Ok(ScheduledChunk {
            start,
            end,
            samples: resampled.len(),
        })
    }

    /// Drop queued audio and restart scheduling from the current output time.
    pub fn interrupt(&mut self) {
        self.output.cancel();
        self.next_start = self.output.current_time();
    }

    /// Seconds of audio still queued ahead of the output clock.
    pub fn buffered(&self) -> f64 {
        (self.next_start - self.output.current_time()).max(0.0)
    }

    pub fn chunks_played(&self) -> u64 {
        self.chunks_played
    }

    /// Smoothed level of the audio handed to the output.
    pub fn level(&self) -> f32 {
        self.level.level()
    }

    /// Flush the output device, e.g. write out a recording.
    pub fn flush(&mut self) -> VoiceResult<()> {
        self.output.flush()
    }

    pub fn output(&self) -> &dyn AudioOutput {
        self.output.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::VirtualOutput;
    use crate::audio::frame::AudioCodec;
    use crate::error::VoiceError;

    fn half_second_chunk(rate: u32) -> Vec<u8> {
        format::samples_to_bytes(&vec![1_000; rate as usize / 2])
    }

    #[test]
    fn test_back_to_back_chunks_have_no_gap_or_overlap() {
        let (output, _clock) = VirtualOutput::manual(24_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);

        let first = engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        let second = engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();

        assert_eq!(first.start, 0.0);
        assert_eq!(first.end, 0.5);
        assert_eq!(second.start, first.end);
        assert_eq!(second.end, 1.0);
        assert_eq!(engine.chunks_played(), 2);
    }

    #[test]
    fn test_late_chunk_starts_at_output_clock() {
        let (output, clock) = VirtualOutput::manual(24_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);

        engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        clock.set(2.0);
        let late = engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        assert_eq!(late.start, 2.0);
        assert_eq!(late.end, 2.5);
    }

    #[test]
    fn test_recorded_timeline_is_continuous() {
        let (output, _clock) = VirtualOutput::manual(16_000);
        let mut engine = PlaybackEngine::new(Box::new(output.with_recording()), 0.3);

        // Two 0.5 s chunks at 24 kHz resampled to a 16 kHz output.
        engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        let second = engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        assert_eq!(second.start, 0.5);
        assert_eq!(engine.buffered(), 1.0);
    }

    #[test]
    fn test_stereo_input_is_downmixed() {
        let (output, _clock) = VirtualOutput::manual(8_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);
        let stereo = format::samples_to_bytes(&[100, 300, 100, 300]);
        let chunk = engine.play(&stereo, 8_000, 2).unwrap();
        assert_eq!(chunk.samples, 2);
    }

    #[test]
    fn test_misaligned_buffer_is_format_error() {
        let (output, _clock) = VirtualOutput::manual(8_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);
        let err = engine.play(&[0, 0, 0], 8_000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::Format(FormatError::MisalignedBuffer { .. })));
        assert_eq!(engine.chunks_played(), 0);
    }

    #[test]
    fn test_mulaw_wire_chunk_is_decoded() {
        let (output, _clock) = VirtualOutput::manual(8_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);
        let wire = WireFormat::telephony(AudioCodec::Mulaw);
        let chunk = engine.play_wire(&[0xFF; 800], &wire).unwrap();
        assert_eq!(chunk.samples, 800);
        assert!((chunk.duration() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_restarts_from_clock() {
        let (output, clock) = VirtualOutput::manual(24_000);
        let mut engine = PlaybackEngine::new(Box::new(output), 0.3);
        engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        clock.set(0.1);
        engine.interrupt();
        let next = engine.play(&half_second_chunk(24_000), 24_000, 1).unwrap();
        assert!((next.start - 0.1).abs() < 1e-9);
    }
}

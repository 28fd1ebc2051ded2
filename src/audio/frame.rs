//! # Audio Frames and Wire Formats
//!
//! Plain data types shared by the capture engine, the format adapter and the transports.
//!
//! ## Audio Format Defaults:
//! - **Uplink**: PCM16, mono, 16 kHz
//! - **Downlink**: PCM16, mono, 24 kHz
//! - **Telephony**: mu-law or A-law, mono, 8 kHz

use crate::error::FormatError;
use serde::{Deserialize, Serialize};

/// A block of interleaved signed 16-bit PCM samples produced by the capture engine.
///
/// ## Ownership:
/// A frame is moved (never cloned) across the audio-thread hand-off and consumed
/// exactly once, either by the format adapter or directly by a transport.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Monotonically increasing per capture session, starting at 0.
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            sequence,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Serialize the samples as little-endian PCM16 bytes.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        super::format::samples_to_bytes(&self.samples)
    }
}

/// Sample encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    /// Linear 16-bit little-endian PCM.
    Pcm16,
    /// G.711 mu-law, 8 bits per sample.
    Mulaw,
    /// G.711 A-law, 8 bits per sample.
    Alaw,
}

impl AudioCodec {
    /// Bytes per encoded sample.
    pub fn sample_width(&self) -> usize {
        match self {
            AudioCodec::Pcm16 => 2,
            AudioCodec::Mulaw | AudioCodec::Alaw => 1,
        }
    }

    pub fn is_companded(&self) -> bool {
        !matches!(self, AudioCodec::Pcm16)
    }
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AudioCodec::Pcm16 => "pcm16",
            AudioCodec::Mulaw => "mulaw",
            AudioCodec::Alaw => "alaw",
        };
        f.write_str(name)
    }
}

/// Audio format negotiated at bootstrap and fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WireFormat {
    pub const fn pcm16(sample_rate: u32) -> Self {
        Self {
            codec: AudioCodec::Pcm16,
            sample_rate,
            channels: 1,
        }
    }

    pub const fn telephony(codec: AudioCodec) -> Self {
        Self {
            codec,
            sample_rate: 8_000,
            channels: 1,
        }
    }

    /// Default browser uplink: PCM16 mono 16 kHz.
    pub const fn default_uplink() -> Self {
        Self::pcm16(16_000)
    }

    /// Default downlink: PCM16 mono 24 kHz.
    pub const fn default_downlink() -> Self {
        Self::pcm16(24_000)
    }

    /// Size in bytes of one sample frame (all channels).
    pub fn frame_stride(&self) -> usize {
        self.codec.sample_width() * self.channels as usize
    }

    /// Check that the combination can be produced by the adapter.
    ///
    /// ## Rules:
    /// - sample rate and channel count must be non-zero
    /// - at most two channels
    /// - companded codecs are telephony formats: 8 kHz mono only
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.sample_rate == 0 {
            return Err(FormatError::InvalidSampleRate(self.sample_rate));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(FormatError::UnsupportedChannels(self.channels));
        }
        if self.codec.is_companded() {
            if self.sample_rate != 8_000 {
                return Err(FormatError::InvalidSampleRate(self.sample_rate));
            }
            if self.channels != 1 {
                return Err(FormatError::UnsupportedChannels(self.channels));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}Hz/{}ch", self.codec, self.sample_rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0; 320], 16_000, 1, 0);
        assert_eq!(frame.frame_count(), 320);
        assert!((frame.duration_ms() - 20.0).abs() < f64::EPSILON);

        let stereo = AudioFrame::new(vec![0; 320], 16_000, 2, 1);
        assert_eq!(stereo.frame_count(), 160);
    }

    #[test]
    fn test_wire_format_validation() {
        assert!(WireFormat::default_uplink().validate().is_ok());
        assert!(WireFormat::telephony(AudioCodec::Mulaw).validate().is_ok());

        let wideband_mulaw = WireFormat {
            codec: AudioCodec::Mulaw,
            sample_rate: 16_000,
            channels: 1,
        };
        assert_eq!(
            wideband_mulaw.validate(),
            Err(FormatError::InvalidSampleRate(16_000))
        );
        assert_eq!(
            WireFormat::pcm16(0).validate(),
            Err(FormatError::InvalidSampleRate(0))
        );
    }

    #[test]
    fn test_wire_format_serde_names() {
        let json = serde_json::to_string(&WireFormat::telephony(AudioCodec::Alaw)).unwrap();
        assert_eq!(json, r#"{"codec":"alaw","sample_rate":8000,"channels":1}"#);
    }
}

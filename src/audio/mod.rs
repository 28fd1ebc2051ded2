//! # Audio Pipeline
//!
//! Everything between the microphone and the transport, and between the transport and
//! the speaker.
//!
//! ## Key Components:
//! - **Format Adapter**: resampling, bit depth, downmix, G.711 mu-law/A-law
//! - **Capture Engine**: device framing and the audio-thread hand-off
//! - **Playback Engine**: gapless scheduling on the output clock
//! - **Level Meter**: lock-free rolling energy estimate
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16-bit PCM, 16 kHz mono recommended
//! - **Encoding**: little-endian signed integers
//! - **Wire**: fixed per session, see [`frame::WireFormat`]

pub mod capture;  // Frame cutting and hand-off
pub mod device;   // Input/output device seams
pub mod format;   // Pure conversion functions
pub mod frame;    // AudioFrame and wire formats
pub mod level;
pub mod playback; // Output scheduling

pub use capture::{frame_handoff, CaptureEngine, CaptureEvent, CaptureStatus, FrameConsumer, FrameReceiver, FrameSink};
pub use device::{AudioInput, AudioOutput, CaptureConstraints, VirtualOutput, WavFileInput};
pub use frame::{AudioCodec, AudioFrame, WireFormat};
pub use level::LevelMeter;
pub use playback::{PlaybackEngine, ScheduledChunk};

//! # Voice Session
//!
//! Real-time voice session layer: captures microphone audio, streams it to a voice AI
//! provider over WebSocket or WebRTC, plays the provider's audio back, and keeps a
//! subscribable snapshot of the session for whatever UI sits on top.
//!
//! ## Module Overview:
//! - **audio**: format adapter, capture framing, playback scheduling, level metering
//! - **transport**: reconnecting WebSocket client and WebRTC peer transport
//! - **session**: bootstrap collaborator, session manager, state store, call history
//! - **persistence**: durable snapshot of the non-live session state
//! - **config** / **error**: layered configuration and the shared error taxonomy

pub mod audio;
pub mod config;
pub mod error;
pub mod persistence;
pub mod session;
pub mod transport;

pub use error::{VoiceError, VoiceResult};
pub use session::{Provider, SessionManager, SessionOptions};

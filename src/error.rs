//! # Error Handling
//!
//! Error types shared by every layer of the voice session library.
//!
//! ## Error Taxonomy:
//! - **PermissionDenied / DeviceUnavailable**: microphone acquisition failed, surfaced synchronously
//! - **AudioDevice**: device lost while capturing (recoverable, never retried automatically)
//! - **Connection**: transport-level failure, retried by the owning transport's backoff policy
//! - **ProviderSwitch**: hot switch failed, carries whether the previous provider was restored
//! - **Configuration**: invalid caller input, never retried
//! - **Format**: malformed audio buffer, a programmer or protocol error
//!
//! ## Propagation:
//! Device and configuration errors are returned directly from the call that caused them.
//! Connection and switch errors are additionally published through the session state
//! stream so subscribers never have to run their own retry loop.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the pure audio format adapter.
///
/// Kept separate from [`VoiceError`] so the adapter has no dependency on the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Buffer length is not a whole number of samples (or sample frames).
    #[error("buffer of {len} bytes is not a multiple of the {stride}-byte sample stride")]
    MisalignedBuffer { len: usize, stride: usize },

    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("unsupported bit depth: {0} bits")]
    UnsupportedBitDepth(u16),

    #[error("unsupported channel layout: {0} channels")]
    UnsupportedChannels(u16),
}

/// Library-wide error type.
///
/// ## Usage Example:
/// ```rust
/// use voice_session::error::VoiceError;
///
/// let err = VoiceError::connection("socket closed by peer");
/// assert!(err.is_recoverable());
/// assert_eq!(err.code(), "connection_error");
/// ```
#[derive(Debug, Clone, Error)]
pub enum VoiceError {
    /// The user or platform refused microphone access.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture or playback device.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device disappeared while capturing.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// Switching providers failed. `rolled_back` tells whether the old connection was restored.
    #[error("provider switch failed ({}): {message}", rollback_note(.rolled_back))]
    ProviderSwitch { message: String, rolled_back: bool },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("audio format error: {0}")]
    Format(#[from] FormatError),
}

impl VoiceError {
    pub fn connection(message: impl Into<String>) -> Self {
        VoiceError::Connection(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        VoiceError::Configuration(message.into())
    }

    pub fn provider_switch(message: impl Into<String>, rolled_back: bool) -> Self {
        VoiceError::ProviderSwitch {
            message: message.into(),
            rolled_back,
        }
    }

    /// Stable machine-readable code, used by the error log and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => "permission_denied",
            VoiceError::DeviceUnavailable(_) => "device_unavailable",
            VoiceError::AudioDevice(_) => "audio_device_error",
            VoiceError::Connection(_) => "connection_error",
            VoiceError::ProviderSwitch { .. } => "provider_switch_error",
            VoiceError::Configuration(_) => "configuration_error",
            VoiceError::Format(_) => "format_error",
        }
    }

    /// Whether retrying (automatically or through a recovery action) can succeed.
    ///
    /// Configuration and format errors require a code or input change, so they are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VoiceError::PermissionDenied(_)
            | VoiceError::DeviceUnavailable(_)
            | VoiceError::AudioDevice(_)
            | VoiceError::Connection(_)
            | VoiceError::ProviderSwitch { .. } => true,
            VoiceError::Configuration(_) | VoiceError::Format(_) => false,
        }
    }
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "previous provider restored"
    } else {
        "no connection restored"
    }
}

/// Serializable view of an error for snapshots and API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&VoiceError> for ErrorInfo {
    fn from(err: &VoiceError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// Type alias for Results that use the library error type.
pub type VoiceResult<T> = Result<T, VoiceError>;

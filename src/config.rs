//! # Application Configuration
//!
//! Settings for the voice session daemon, loaded from several layered sources.
//!
//! ## Configuration Sources (in order of priority):
//! 1. **Environment variables** (highest priority): `VOICE__SESSION__BOOTSTRAP_URL`,
//!    `VOICE__AUDIO__UPLINK__CODEC`, ... plus plain `HOST` / `PORT`
//! 2. **config.toml file**: optional, next to the binary's working directory
//! 3. **Default values** (lowest priority): [`AppConfig::default`]
//!
//! ## Rust Concepts Used:
//! - **Serde**: the same structs are serialized into the `config` builder as defaults and
//!   deserialized back out of the merged sources
//! - **Option<T>**: unset optional paths (`input_wav`, `snapshot_path`) stay `None`
//! - **Conversions**: [`AppConfig::session_options`] and [`AppConfig::transport_settings`]
//!   turn file-shaped settings into the library's runtime types

use crate::audio::device::CaptureConstraints;
use crate::audio::frame::WireFormat;
use crate::error::{VoiceError, VoiceResult};
use crate::session::{Provider, SessionOptions};
use crate::transport::{AudioFraming, Credentials, ReconnectPolicy, TransportKind, TransportSettings};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
}

/// HTTP server settings for the daemon's control API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind to ("127.0.0.1" for local only, "0.0.0.0" for all interfaces)
    pub host: String,
    pub port: u16,
}

/// Provider session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL of the session bootstrap service (`POST {bootstrap_url}/sessions`).
    pub bootstrap_url: String,
    pub provider_type: String,
    pub default_provider: Provider,
    pub transport: TransportKind,
    pub handshake_timeout_ms: u64,
    pub history_capacity: usize,
    pub error_log_capacity: usize,
    /// Where the session snapshot is persisted; `None` disables persistence.
    pub snapshot_path: Option<String>,
    pub snapshot_max_age_secs: u64,
    /// Environment variable holding the bearer token. Read on every connection attempt.
    pub token_env: String,
}

/// Reconnect and keep-alive behaviour shared by both transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub reconnect_enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries after the first failure before the transport gives up.
    pub max_attempts: u32,
    pub keepalive_secs: u64,
    pub stats_interval_ms: u64,
    pub audio_framing: AudioFraming,
}

/// Capture, wire and playback formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    /// Frame length handed to the uplink, in milliseconds.
    pub frame_duration_ms: u32,
    pub uplink: WireFormat,
    pub downlink: WireFormat,
    pub output_sample_rate: u32,
    /// Frames the device-to-session FIFO holds before dropping.
    pub handoff_capacity: usize,
    /// Level meter smoothing in `0.0..1.0`.
    pub level_smoothing: f32,
    pub level_interval_ms: u64,
    /// Use a WAV file as the microphone (looped). `None` means no capture device.
    pub input_wav: Option<String>,
    /// Record everything played to this WAV file, written on shutdown.
    pub record_output_wav: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                bootstrap_url: "http://127.0.0.1:8000/api/v1/".to_string(),
                provider_type: "voice_ai".to_string(),
                default_provider: Provider::default(),
                transport: TransportKind::WebSocket,
                handshake_timeout_ms: 15_000,
                history_capacity: 50,
                error_log_capacity: 100,
                snapshot_path: Some("data/session.json".to_string()),
                snapshot_max_age_secs: 24 * 60 * 60,
                token_env: "VOICE_SESSION_TOKEN".to_string(),
            },
            transport: TransportConfig {
                reconnect_enabled: true,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                max_attempts: 5,
                keepalive_secs: 15,
                stats_interval_ms: 1_000,
                audio_framing: AudioFraming::Binary,
            },
            audio: AudioConfig {
                capture_sample_rate: 16_000,
                capture_channels: 1,
                frame_duration_ms: 20,
                uplink: WireFormat::default_uplink(),
                downlink: WireFormat::default_downlink(),
                output_sample_rate: 24_000,
                handoff_capacity: 64,
                level_smoothing: 0.8,
                level_interval_ms: 250,
                input_wav: None,
                record_output_wav: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and environment variables.
    ///
    /// ## Example Environment Variables:
    /// ```bash
    /// export PORT=3000
    /// export VOICE__SESSION__DEFAULT_PROVIDER=provider_b
    /// export VOICE__AUDIO__UPLINK__CODEC=mulaw
    /// ```
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("__")
                    .separator("__"),
            );

        // Plain HOST / PORT as most deployment platforms set them.
        if let Ok(host) = std::env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = std::env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the library cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.server.port == 0 {
            return Err(VoiceError::configuration("server port cannot be 0"));
        }
        if self.server.host.trim().is_empty() {
            return Err(VoiceError::configuration("server host cannot be empty"));
        }

        let bootstrap = url::Url::parse(&self.session.bootstrap_url).map_err(|e| {
            VoiceError::configuration(format!("invalid bootstrap_url '{}': {}", self.session.bootstrap_url, e))
        })?;
        if !matches!(bootstrap.scheme(), "http" | "https") {
            return Err(VoiceError::configuration("bootstrap_url must use http:// or https://"));
        }
        if self.session.handshake_timeout_ms == 0 {
            return Err(VoiceError::configuration("handshake_timeout_ms must be greater than 0"));
        }
        if self.session.history_capacity == 0 || self.session.error_log_capacity == 0 {
            return Err(VoiceError::configuration(
                "history_capacity and error_log_capacity must be greater than 0",
            ));
        }
        if self.session.token_env.trim().is_empty() {
            return Err(VoiceError::configuration("token_env cannot be empty"));
        }

        let transport = &self.transport;
        if transport.base_delay_ms > transport.max_delay_ms {
            return Err(VoiceError::configuration(format!(
                "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                transport.base_delay_ms, transport.max_delay_ms
            )));
        }
        if transport.reconnect_enabled && transport.base_delay_ms == 0 {
            return Err(VoiceError::configuration("base_delay_ms must be greater than 0"));
        }
        if transport.keepalive_secs == 0 || transport.stats_interval_ms == 0 {
            return Err(VoiceError::configuration(
                "keepalive_secs and stats_interval_ms must be greater than 0",
            ));
        }

        let audio = &self.audio;
        if audio.capture_sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(VoiceError::configuration("sample rates must be greater than 0"));
        }
        if audio.handoff_capacity == 0 || audio.frame_duration_ms == 0 || audio.level_interval_ms == 0 {
            return Err(VoiceError::configuration(
                "handoff_capacity, frame_duration_ms and level_interval_ms must be greater than 0",
            ));
        }
        if !(0.0..1.0).contains(&audio.level_smoothing) {
            return Err(VoiceError::configuration("level_smoothing must be in 0.0..1.0"));
        }
        audio.uplink.validate()?;
        audio.downlink.validate()?;
        self.session_options()?.validate()
    }

    /// Apply a partial JSON update, e.g. `{"transport": {"max_attempts": 3}}`.
    ///
    /// Unknown keys are rejected. Nothing changes unless the merged result validates.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            anyhow::bail!("configuration update must be a JSON object");
        }
        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch, "")?;
        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let transport = &self.transport;
        TransportSettings {
            reconnect: ReconnectPolicy {
                enabled: transport.reconnect_enabled,
                base_delay_ms: transport.base_delay_ms,
                max_delay_ms: transport.max_delay_ms,
                max_attempts: transport.max_attempts,
            },
            handshake_timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            keepalive: Duration::from_secs(transport.keepalive_secs),
            stats_interval: Duration::from_millis(transport.stats_interval_ms),
            audio_framing: transport.audio_framing,
        }
    }

    pub fn session_options(&self) -> VoiceResult<SessionOptions> {
        let audio = &self.audio;
        Ok(SessionOptions {
            provider_type: self.session.provider_type.clone(),
            default_provider: self.session.default_provider,
            transport: self.session.transport,
            transport_settings: self.transport_settings(),
            handshake_timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            uplink: audio.uplink,
            downlink: audio.downlink,
            capture: CaptureConstraints {
                sample_rate: audio.capture_sample_rate,
                channels: audio.capture_channels,
                ..CaptureConstraints::default()
            },
            frame_duration_ms: audio.frame_duration_ms,
            level_smoothing: audio.level_smoothing,
            level_interval: Duration::from_millis(audio.level_interval_ms),
            handoff_capacity: audio.handoff_capacity,
            history_capacity: self.session.history_capacity,
            error_log_capacity: self.session.error_log_capacity,
        })
    }

    /// Bearer token read from `token_env` on every connection attempt.
    pub fn credentials(&self) -> Credentials {
        let name = self.session.token_env.clone();
        Credentials::from_fn(move || std::env::var(&name).ok().filter(|t| !t.is_empty()))
    }
}

/// Recursively overlay `patch` onto `base`. Keys missing from `base` are errors.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value, path: &str) -> Result<()> {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                let field = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value, &field)?,
                    None => anyhow::bail!("unknown configuration key '{}'", field),
                }
            }
            Ok(())
        }
        (slot, value) => {
            *slot = value;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioCodec;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.provider_type, "voice_ai");
        assert_eq!(config.audio.uplink, WireFormat::pcm16(16_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transport.base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.handoff_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.bootstrap_url = "ws://host/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_companded_codecs_need_telephony_rate() {
        let mut config = AppConfig::default();
        config.audio.uplink = WireFormat {
            codec: AudioCodec::Mulaw,
            sample_rate: 16_000,
            channels: 1,
        };
        assert!(matches!(config.validate(), Err(VoiceError::Format(_))));

        config.audio.uplink = WireFormat::telephony(AudioCodec::Mulaw);
        config.audio.downlink = WireFormat::telephony(AudioCodec::Alaw);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"server": {"port": 9000}, "transport": {"max_attempts": 2}, "session": {"default_provider": "provider_c"}}"#)
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.transport.max_attempts, 2);
        assert_eq!(config.session.default_provider, Provider::ProviderC);
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"colour": "blue"}}"#).is_err());
        assert!(config.update_from_json(r#"[1, 2]"#).is_err());
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_runtime_conversions() {
        let mut config = AppConfig::default();
        config.transport.reconnect_enabled = false;
        config.audio.capture_sample_rate = 48_000;

        let settings = config.transport_settings();
        assert!(!settings.reconnect.enabled);
        assert_eq!(settings.keepalive, Duration::from_secs(15));

        let options = config.session_options().unwrap();
        assert_eq!(options.capture.sample_rate, 48_000);
        assert_eq!(options.handshake_timeout, Duration::from_millis(15_000));
        assert_eq!(options.transport_settings, settings);
    }

    #[test]
    fn test_credentials_read_environment_per_attempt() {
        let mut config = AppConfig::default();
        config.session.token_env = format!("VOICE_TEST_TOKEN_{}", uuid::Uuid::new_v4().simple());
        let credentials = config.credentials();
        assert!(credentials.token().is_none());
        std::env::set_var(&config.session.token_env, "secret");
        assert_eq!(credentials.token().as_deref(), Some("secret"));
        std::env::remove_var(&config.session.token_env);
    }
}

//! # Wire Envelopes
//!
//! Every application message is a JSON object with a mandatory `type` field.
//!
//! ## Outbound (`{"type": ..., ...fields}`):
//! - `config`: session settings, sent right after each connection opens
//! - `update`: mid-call settings change
//! - `ping`: keep-alive carrying the sender's clock
//! - `input_audio`: base64 audio for providers that do not accept binary frames
//!
//! ## Inbound (`{"type": ..., "data": {...}}`):
//! `transcription`, `sentiment`, `function_call`, `error`, `pong`, `audio`.
//!
//! Decoding fails closed: an unknown `type` or a payload that does not match its type is
//! logged and dropped, never surfaced as an error to the caller.

use crate::audio::frame::WireFormat;
use crate::session::call::CallDirection;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Session settings as the provider sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub direction: CallDirection,
    pub input_format: WireFormat,
    pub output_format: WireFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Config(SessionSettings),
    Update {
        #[serde(skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    InputAudio {
        /// Base64 of the encoded audio in the session uplink format.
        audio: String,
        sequence: u64,
    },
}

impl OutboundMessage {
    pub fn ping_now() -> Self {
        OutboundMessage::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn input_audio(encoded: &[u8], sequence: u64) -> Self {
        OutboundMessage::InputAudio {
            audio: BASE64.encode(encoded),
            sequence,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    /// Base64 of audio in the session downlink format.
    pub audio: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Transcription(Transcription),
    Sentiment(Sentiment),
    FunctionCall(FunctionCall),
    Error(ProviderError),
    Pong(Pong),
    Audio(AudioPayload),
}

impl AudioPayload {
    pub fn decode(&self) -> Option<Vec<u8>> {
        BASE64.decode(self.audio.as_bytes()).ok()
    }
}

/// Decode an inbound text frame. Unknown or malformed messages are logged and dropped.
pub fn decode_inbound(text: &str) -> Option<InboundMessage> {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => Some(message),
        Err(e) => {
            let kind = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned));
            match kind {
                Some(kind) => warn!(message_type = %kind, error = %e, "Dropping unrecognized inbound message"),
                None => warn!(error = %e, "Dropping inbound message without a type"),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_envelopes_are_flat_with_type() {
        let ping = serde_json::to_value(OutboundMessage::Ping { timestamp: 42 }).unwrap();
        assert_eq!(ping, json!({"type": "ping", "timestamp": 42}));

        let update = serde_json::to_value(OutboundMessage::Update {
            instructions: Some("be brief".into()),
        })
        .unwrap();
        assert_eq!(update, json!({"type": "update", "instructions": "be brief"}));
    }

    #[test]
    fn test_config_envelope_carries_formats() {
        let settings = SessionSettings {
            session_id: "s1".into(),
            instructions: None,
            target: Some("+15550100".into()),
            direction: CallDirection::Outbound,
            input_format: WireFormat::default_uplink(),
            output_format: WireFormat::default_downlink(),
        };
        let value = serde_json::to_value(OutboundMessage::Config(settings)).unwrap();
        assert_eq!(value["type"], "config");
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["direction"], "outbound");
        assert_eq!(value["output_format"]["sample_rate"], 24_000);
        assert!(value.get("instructions").is_none());
    }

    #[test]
    fn test_inbound_messages_decode_by_type() {
        let text = r#"{"type":"transcription","data":{"text":"hello","is_final":true}}"#;
        match decode_inbound(text) {
            Some(InboundMessage::Transcription(t)) => {
                assert_eq!(t.text, "hello");
                assert!(t.is_final);
            }
            other => panic!("unexpected {:?}", other),
        }

        let call = r#"{"type":"function_call","data":{"name":"lookup","arguments":{"id":7}}}"#;
        assert!(matches!(decode_inbound(call), Some(InboundMessage::FunctionCall(f)) if f.arguments["id"] == 7));
    }

    #[test]
    fn test_unknown_and_malformed_messages_are_dropped() {
        assert!(decode_inbound(r#"{"type":"karaoke","data":{}}"#).is_none());
        assert!(decode_inbound(r#"{"type":"sentiment","data":{"score":0.5}}"#).is_none());
        assert!(decode_inbound("not json").is_none());
        assert!(decode_inbound(r#"{"data":{}}"#).is_none());
    }

    #[test]
    fn test_audio_payload_round_trips_base64() {
        let outbound = OutboundMessage::input_audio(&[1, 2, 3, 4], 9);
        let OutboundMessage::InputAudio { audio, sequence } = outbound else {
            panic!("wrong variant");
        };
        assert_eq!(sequence, 9);
        assert_eq!(AudioPayload { audio }.decode().unwrap(), vec![1, 2, 3, 4]);
    }
}

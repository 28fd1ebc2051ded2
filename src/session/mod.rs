//! # Provider Sessions
//!
//! The orchestration layer: who we are talking to, over which transport, and what the
//! caller should see.
//!
//! ## Key Components:
//! - **SessionManager**: connect, disconnect, hot provider switch, audio start/stop, recovery
//! - **SessionStore**: the subscribable snapshot plus the application event broadcast
//! - **SessionBootstrap**: the REST collaborator that hands out session ids and endpoints
//! - **CallHistory / ErrorLog**: bounded ring buffers of finished calls and recent errors

pub mod bootstrap;
pub mod call;
pub mod error_log;
pub mod manager;
pub mod store;

pub use bootstrap::{BootstrapRequest, BootstrapResponse, HttpBootstrap, SessionBootstrap};
pub use call::{CallDirection, CallHistory, CallState, CallStatus};
pub use error_log::{ErrorLog, ErrorRecord, RecoveryAction};
pub use manager::{SessionManager, SessionManagerBuilder, SessionMetadata, SessionOptions};
pub use store::{SessionEvent, SessionSnapshot, SessionStore};

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};

/// Interchangeable voice AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    ProviderA,
    ProviderB,
    ProviderC,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::ProviderA, Provider::ProviderB, Provider::ProviderC];

    /// Name used on the wire and in configuration.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Provider::ProviderA => "provider_a",
            Provider::ProviderB => "provider_b",
            Provider::ProviderC => "provider_c",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for Provider {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "provider_a" | "a" => Ok(Provider::ProviderA),
            "provider_b" | "b" => Ok(Provider::ProviderB),
            "provider_c" | "c" => Ok(Provider::ProviderC),
            other => Err(VoiceError::configuration(format!(
                "unknown provider '{}'. Valid options: provider_a, provider_b, provider_c",
                other
            ))),
        }
    }
}

//! # Session Bootstrap
//!
//! The REST collaborator that creates provider sessions and receives lifecycle notices.
//!
//! ## Endpoints:
//! - `POST /sessions` with `{provider_type, provider}` returns `{session_id, websocket_url, metadata}`
//! - `POST /sessions/{id}/start` and `POST /sessions/{id}/end` are best-effort notices;
//!   callers log their failures and carry on

use crate::error::{VoiceError, VoiceResult};
use crate::session::Provider;
use crate::transport::{Credentials, TransportKind};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub provider_type: String,
    pub provider: Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub session_id: String,
    /// Absolute `ws(s)://` URL or a path relative to the bootstrap service.
    pub websocket_url: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub trait SessionBootstrap: Send + Sync {
    fn create_session(&self, request: BootstrapRequest) -> BoxFuture<'_, VoiceResult<BootstrapResponse>>;

    fn start_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>>;

    fn end_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>>;

    /// Base that relative `websocket_url`s are resolved against.
    fn base_url(&self) -> Option<&Url> {
        None
    }
}

/// Bootstrap over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpBootstrap {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

impl HttpBootstrap {
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> VoiceResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| VoiceError::configuration(format!("invalid bootstrap url '{}': {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(VoiceError::configuration("bootstrap url must use http:// or https://"));
        }
        // Keep the last path segment when joining.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn url(&self, path: &str) -> VoiceResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| VoiceError::configuration(format!("invalid bootstrap path '{}': {}", path, e)))
    }

    async fn post_notice(&self, session_id: &str, action: &str) -> VoiceResult<()> {
        let url = self.url(&format!("sessions/{}/{}", session_id, action))?;
        let mut request = self.client.post(url);
        if let Some(token) = self.credentials.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::connection(format!("session {} notice failed: {}", action, e)))?;
        if !response.status().is_success() {
            return Err(VoiceError::connection(format!(
                "session {} notice rejected with status {}",
                action,
                response.status()
            )));
        }
        debug!(session_id = %session_id, action = %action, "Session lifecycle notice sent");
        Ok(())
    }
}

impl SessionBootstrap for HttpBootstrap {
    fn create_session(&self, request: BootstrapRequest) -> BoxFuture<'_, VoiceResult<BootstrapResponse>> {
        Box::pin(async move {
            let url = self.url("sessions")?;
            let mut http = self.client.post(url).json(&request);
            if let Some(token) = self.credentials.token() {
                http = http.bearer_auth(token);
            }
            let response = http
                .send()
                .await
                .map_err(|e| VoiceError::connection(format!("session bootstrap failed: {}", e)))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(VoiceError::connection(format!(
                    "session bootstrap rejected with status {}: {}",
                    status, body
                )));
            }
            response
                .json::<BootstrapResponse>()
                .await
                .map_err(|e| VoiceError::connection(format!("invalid bootstrap response: {}", e)))
        })
    }

    fn start_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
        Box::pin(self.post_notice(session_id, "start"))
    }

    fn end_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
        Box::pin(self.post_notice(session_id, "end"))
    }

    fn base_url(&self) -> Option<&Url> {
        Some(&self.base_url)
    }
}

/// Path plus query of a transport URL: `wss://host/ws/s1?x=1` gives `/ws/s1?x=1`.
pub fn derive_transport_path(websocket_url: &str) -> VoiceResult<String> {
    let url = Url::parse(websocket_url)
        .map_err(|e| VoiceError::configuration(format!("invalid websocket_url '{}': {}", websocket_url, e)))?;
    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}

/// Turn a bootstrap `websocket_url` into the endpoint the chosen transport connects to.
///
/// WebSocket transports get a `ws(s)://` URL; WebRTC signaling gets the `http(s)://` form
/// of the same location. Relative URLs are resolved against `base`.
pub fn resolve_endpoint(base: Option<&Url>, websocket_url: &str, kind: TransportKind) -> VoiceResult<Url> {
    let mut url = match Url::parse(websocket_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| {
                VoiceError::configuration(format!("relative websocket_url '{}' without a base", websocket_url))
            })?;
            base.join(websocket_url)
                .map_err(|e| VoiceError::configuration(format!("invalid websocket_url '{}': {}", websocket_url, e)))?
        }
        Err(e) => {
            return Err(VoiceError::configuration(format!(
                "invalid websocket_url '{}': {}",
                websocket_url, e
            )))
        }
    };

    let secure = matches!(url.scheme(), "wss" | "https");
    let scheme = match (kind, secure) {
        (TransportKind::WebSocket, true) => "wss",
        (TransportKind::WebSocket, false) => "ws",
        (TransportKind::WebRtc, true) => "https",
        (TransportKind::WebRtc, false) => "http",
    };
    if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
        return Err(VoiceError::configuration(format!(
            "unsupported transport scheme {}://",
            url.scheme()
        )));
    }
    url.set_scheme(scheme)
        .map_err(|_| VoiceError::configuration(format!("cannot use {}:// for {}", scheme, url)))?;
    Ok(url)
}

//! In-process WebSocket provider and bootstrap service for integration tests.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use voice_session::session::{BootstrapRequest, BootstrapResponse, SessionBootstrap};
use voice_session::transport::{ReconnectPolicy, TransportEvent, TransportSettings};
use voice_session::{Provider, VoiceResult};

pub const WAIT: Duration = Duration::from_secs(5);

/// One accepted client connection.
pub struct ServerConn {
    /// Request path and query, e.g. `/ws/s1?provider=provider_a`.
    pub path: String,
    pub authorization: Option<String>,
    pub ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next text frame, skipping pings and binary frames.
    pub async fn next_text(&mut self) -> Option<serde_json::Value> {
        tokio::time::timeout(WAIT, async {
            while let Some(frame) = self.ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Wait until the client closes this connection.
    pub async fn closed(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .is_ok()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (info_tx, info_rx) = oneshot::channel();
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let authorization = req
                            .headers()
                            .get(AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        let _ = info_tx.send((req.uri().to_string(), authorization));
                        Ok(resp)
                    };
                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        if let Ok((path, authorization)) = info_rx.await {
                            let _ = tx.send(ServerConn { path, authorization, ws });
                        }
                    }
                });
            }
        });
        Self { addr, connections }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Whether a connection arrives within `within`.
    pub async fn connection_within(&mut self, within: Duration) -> bool {
        matches!(tokio::time::timeout(within, self.connections.recv()).await, Ok(Some(_)))
    }
}

pub fn fast_settings(max_attempts: u32) -> TransportSettings {
    TransportSettings {
        reconnect: ReconnectPolicy {
            enabled: true,
            base_delay_ms: 10,
            max_delay_ms: 40,
            max_attempts,
        },
        handshake_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Receive transport events until one matches `pred`.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("transport event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching transport event within timeout")
}

/// Bootstrap service that hands out `s1`, `s2`, ... on a [`TestServer`].
pub struct LocalBootstrap {
    base: String,
    counter: AtomicU32,
    pub created: Mutex<Vec<(Provider, String)>>,
    pub started: Mutex<Vec<String>>,
    pub ended: Mutex<Vec<String>>,
}

impl LocalBootstrap {
    pub fn new(server: &TestServer) -> Self {
        Self {
            base: format!("ws://{}", server.addr),
            counter: AtomicU32::new(0),
            created: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        }
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }

    /// Poll until `session_id` has been ended.
    pub async fn wait_ended(&self, session_id: &str) -> bool {
        tokio::time::timeout(WAIT, async {
            while !self.ended().iter().any(|id| id == session_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl SessionBootstrap for LocalBootstrap {
    fn create_session(&self, request: BootstrapRequest) -> BoxFuture<'_, VoiceResult<BootstrapResponse>> {
        Box::pin(async move {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("s{}", n);
            self.created.lock().unwrap().push((request.provider, session_id.clone()));
            Ok(BootstrapResponse {
                websocket_url: format!("{}/ws/{}?provider={}", self.base, session_id, request.provider),
                session_id,
                metadata: serde_json::Value::Null,
            })
        })
    }

    fn start_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
        Box::pin(async move {
            self.started.lock().unwrap().push(session_id.to_string());
            Ok(())
        })
    }

    fn end_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, VoiceResult<()>> {
        Box::pin(async move {
            self.ended.lock().unwrap().push(session_id.to_string());
            Ok(())
        })
    }
}

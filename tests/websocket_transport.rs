mod common;

use common::{fast_settings, next_event, TestServer};
use futures_util::SinkExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use voice_session::transport::message::InboundMessage;
use voice_session::transport::{
    AudioFraming, ConnectionState, Credentials, OutboundMessage, TransportEvent, WsTransport,
};

async fn wait_for(transport: &WsTransport, wanted: ConnectionState) {
    let mut state = transport.subscribe_state();
    tokio::time::timeout(common::WAIT, async {
        while *state.borrow_and_update() != wanted {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transport never reached {}", wanted));
}

#[tokio::test]
async fn test_duplex_messages_and_bearer_token() {
    let mut server = TestServer::spawn().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut transport = WsTransport::new(fast_settings(3), tx);
    transport
        .connect(&server.url("/ws/s1?x=1"), Credentials::Static("tok-1".into()))
        .unwrap();

    let mut conn = server.next_connection().await;
    assert_eq!(conn.path, "/ws/s1?x=1");
    assert_eq!(conn.authorization.as_deref(), Some("Bearer tok-1"));
    wait_for(&transport, ConnectionState::Connected).await;

    conn.ws
        .send(Message::Text(r#"{"type":"transcription","data":{"text":"hello","is_final":true}}"#.into()))
        .await
        .unwrap();
    let event = next_event(&mut events, |e| matches!(e, TransportEvent::Message(_))).await;
    assert!(matches!(event, TransportEvent::Message(InboundMessage::Transcription(t)) if t.text == "hello"));

    conn.ws.send(Message::Binary(vec![1, 0, 2, 0])).await.unwrap();
    let event = next_event(&mut events, |e| matches!(e, TransportEvent::Audio(_))).await;
    assert!(matches!(event, TransportEvent::Audio(data) if data == vec![1, 0, 2, 0]));

    assert!(transport.send(&OutboundMessage::Update {
        instructions: Some("be brief".into()),
    }));
    let received = conn.next_text().await.unwrap();
    assert_eq!(received["type"], "update");
    assert_eq!(received["instructions"], "be brief");
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let mut server = TestServer::spawn().await;
    let (tx, _events) = mpsc::unbounded_channel();
    let mut transport = WsTransport::new(fast_settings(3), tx);
    transport.connect(&server.url("/ws/s1"), Credentials::None).unwrap();

    let mut first = server.next_connection().await;
    wait_for(&transport, ConnectionState::Connected).await;
    first.ws.close(None).await.unwrap();

    let second = server.next_connection().await;
    assert_eq!(second.path, "/ws/s1");
    wait_for(&transport, ConnectionState::Connected).await;
    assert_eq!(transport.counters().reconnect_attempts, 1);
}

#[tokio::test]
async fn test_token_is_resolved_on_every_attempt() {
    let mut server = TestServer::spawn().await;
    let (tx, _events) = mpsc::unbounded_channel();
    let mut transport = WsTransport::new(fast_settings(3), tx);
    let issued = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = issued.clone();
    let credentials = Credentials::from_fn(move || {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Some(format!("tok-{}", n))
    });
    transport.connect(&server.url("/ws/s1"), credentials).unwrap();

    let mut first = server.next_connection().await;
    assert_eq!(first.authorization.as_deref(), Some("Bearer tok-1"));
    wait_for(&transport, ConnectionState::Connected).await;
    first.ws.close(None).await.unwrap();

    let second = server.next_connection().await;
    assert_eq!(second.authorization.as_deref(), Some("Bearer tok-2"));
}

#[tokio::test]
async fn test_disconnect_closes_and_never_reconnects() {
    let mut server = TestServer::spawn().await;
    let (tx, _events) = mpsc::unbounded_channel();
    let mut transport = WsTransport::new(fast_settings(5), tx);
    transport.connect(&server.url("/ws/s1"), Credentials::None).unwrap();

    let mut conn = server.next_connection().await;
    wait_for(&transport, ConnectionState::Connected).await;

    transport.disconnect();
    assert_eq!(transport.state(), ConnectionState::Idle);
    assert!(conn.closed().await);
    assert!(!server.connection_within(Duration::from_millis(300)).await);
    assert_eq!(transport.state(), ConnectionState::Idle);
    assert!(!transport.send(&OutboundMessage::Ping { timestamp: 1 }));
}

#[tokio::test]
async fn test_base64_framing_and_keepalive() {
    let mut server = TestServer::spawn().await;
    let (tx, _events) = mpsc::unbounded_channel();
    let mut settings = fast_settings(3);
    settings.audio_framing = AudioFraming::Base64Json;
    settings.keepalive = Duration::from_millis(100);
    let mut transport = WsTransport::new(settings, tx);
    transport.connect(&server.url("/ws/s1"), Credentials::None).unwrap();

    let mut conn = server.next_connection().await;
    wait_for(&transport, ConnectionState::Connected).await;

    assert!(transport.send_audio(&[1, 2, 3, 4], 7));
    let audio = conn.next_text().await.unwrap();
    assert_eq!(audio["type"], "input_audio");
    assert_eq!(audio["sequence"], 7);
    assert_eq!(audio["audio"], "AQIDBA==");

    let ping = conn.next_text().await.unwrap();
    assert_eq!(ping["type"], "ping");
    assert!(ping["timestamp"].as_i64().unwrap() > 0);
}

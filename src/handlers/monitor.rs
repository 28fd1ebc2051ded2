//! # Session Monitor Socket
//!
//! `GET /ws/monitor` streams the session to a UI: every published snapshot and every
//! application event, as JSON text frames.
//!
//! ## Message Format (server to client):
//! ```json
//! {"type": "snapshot", "data": {"status": "connected", "provider": "provider_a", ...}}
//! {"type": "event", "data": {"type": "transcription", "data": {"text": "hello", ...}}}
//! {"type": "lagged", "data": {"missed": 12}}
//! ```
//!
//! The first frame is always the current snapshot. A slow client loses events (reported
//! with `lagged`) but always converges on the latest snapshot.

use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use voice_session::session::{SessionEvent, SessionSnapshot};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Message)]
#[rtype(result = "()")]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MonitorUpdate {
    Snapshot(SessionSnapshot),
    Event(SessionEvent),
    Lagged { missed: u64 },
}

pub struct MonitorSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl MonitorSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }
}

impl Actor for MonitorSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.monitor_attached();
        info!("Monitor socket attached");

        let store = self.state.manager.store();
        ctx.add_message_stream(WatchStream::new(store.subscribe()).map(MonitorUpdate::Snapshot));
        ctx.add_message_stream(BroadcastStream::new(store.subscribe_events()).map(|item| match item {
            Ok(event) => MonitorUpdate::Event(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => MonitorUpdate::Lagged { missed },
        }));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Monitor heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.monitor_detached();
        info!("Monitor socket detached");
    }
}

impl Handler<MonitorUpdate> for MonitorSocket {
    type Result = ();

    fn handle(&mut self, update: MonitorUpdate, ctx: &mut Self::Context) {
        match serde_json::to_string(&update) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!(error = %e, "Cannot encode monitor update"),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MonitorSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                // Read-only socket; anything the client says only counts as liveness.
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Monitor client closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(error = %e, "Monitor socket protocol error");
                ctx.stop();
            }
        }
    }
}

pub async fn monitor_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(MonitorSocket::new(state), &req, stream)
}

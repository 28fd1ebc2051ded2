//! # Voice Session Daemon - Main Application Entry Point
//!
//! Runs one voice session headless and exposes it over HTTP.
//!
//! ## What Runs Here:
//! - **SessionManager**: bootstraps provider sessions through the configured REST service
//!   and streams audio over the configured transport
//! - **Control API**: `/api/v1/session/*` to connect, switch, start audio and recover
//! - **Monitor socket**: `/ws/monitor` streams every snapshot and event to a UI
//! - **Persistence**: the non-live session state survives restarts
//!
//! ## Audio Devices:
//! The daemon has no sound card of its own. `audio.input_wav` plays a WAV file as the
//! microphone and `audio.record_output_wav` records what the provider said.

mod handlers;
mod health;
mod state;

use actix_cors::Cors;
use actix_web::dev::Service;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_session::audio::{VirtualOutput, WavFileInput};
use voice_session::config::AppConfig;
use voice_session::persistence::SessionPersistence;
use voice_session::session::HttpBootstrap;
use voice_session::transport::TransportKind;
use voice_session::SessionManager;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    info!("Starting voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!(
        provider = %config.session.default_provider,
        transport = ?config.session.transport,
        bootstrap = %config.session.bootstrap_url,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let manager = build_manager(&config)?;
    let persistence = config.session.snapshot_path.as_ref().map(|path| {
        Arc::new(SessionPersistence::new(
            path,
            Duration::from_secs(config.session.snapshot_max_age_secs),
        ))
    });
    if let Some(persistence) = &persistence {
        match persistence.restore(&manager) {
            Ok(true) => {}
            Ok(false) => info!(path = %persistence.path().display(), "No session snapshot to restore"),
            Err(e) => warn!(error = %e, "Session snapshot could not be applied"),
        }
    }
    let autosave = persistence
        .clone()
        .map(|persistence| persistence.spawn_autosave(manager.clone()));

    let app_state = AppState::new(config.clone(), manager.clone(), persistence.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap_fn(|req, srv| {
                let started = Instant::now();
                let endpoint = format!(
                    "{} {}",
                    req.method(),
                    req.match_pattern().unwrap_or_else(|| req.path().to_string())
                );
                let state = req.app_data::<web::Data<AppState>>().cloned();
                let response = srv.call(req);
                async move {
                    let result = response.await;
                    let is_error = match &result {
                        Ok(res) => res.status().is_client_error() || res.status().is_server_error(),
                        Err(_) => true,
                    };
                    if let Some(state) = state {
                        state.record_request(&endpoint, started.elapsed().as_millis() as u64, is_error);
                    }
                    result
                }
            })
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(handlers::configure)
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown(&manager, persistence.as_deref(), autosave);
    info!("Server stopped gracefully");
    Ok(())
}

/// Set up `tracing` with `RUST_LOG`, defaulting to `voice_session=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise tracing")?;
    Ok(())
}

fn build_manager(config: &AppConfig) -> Result<SessionManager> {
    let options = config.session_options()?;
    let credentials = config.credentials();
    let bootstrap = HttpBootstrap::new(
        &config.session.bootstrap_url,
        credentials.clone(),
        Duration::from_millis(config.session.handshake_timeout_ms),
    )?;

    let mut output = VirtualOutput::realtime(config.audio.output_sample_rate);
    if let Some(path) = &config.audio.record_output_wav {
        output = output.record_to(path);
    }
    let mut builder = SessionManager::builder(options, Arc::new(bootstrap))
        .credentials(credentials)
        .output(Box::new(output));
    if let Some(path) = &config.audio.input_wav {
        builder = builder.input(Box::new(WavFileInput::new(path).looping(true)));
    }
    if config.session.transport == TransportKind::WebRtc {
        anyhow::bail!("the daemon has no WebRTC peer engine; set session.transport = \"websocket\"");
    }
    Ok(builder.build()?)
}

/// Stop audio and the session, then persist and flush what was recorded.
fn shutdown(manager: &SessionManager, persistence: Option<&SessionPersistence>, autosave: Option<JoinHandle<()>>) {
    manager.disconnect();
    if let Some(task) = autosave {
        task.abort();
    }
    if let Some(persistence) = persistence {
        if let Err(e) = persistence.save(manager) {
            warn!(error = %e, "Final session snapshot failed");
        }
    }
    if let Err(e) = manager.flush_playback() {
        warn!(error = %e, "Playback recording could not be written");
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

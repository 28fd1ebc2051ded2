pub mod config;
pub mod error;
pub mod monitor;
pub mod session;

pub use config::*;
pub use error::AppError;

use actix_web::web;

/// Control API under `/api/v1` plus the monitor socket.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(crate::health::health_check))
            .route("/metrics", web::get().to(crate::health::detailed_metrics))
            .route("/config", web::get().to(get_config))
            .route("/config", web::put().to(update_config))
            .service(
                web::scope("/session")
                    .route("", web::get().to(session::get_session))
                    .route("/connect", web::post().to(session::connect))
                    .route("/disconnect", web::post().to(session::disconnect))
                    .route("/switch", web::post().to(session::switch_provider))
                    .route("/instructions", web::put().to(session::update_instructions))
                    .route("/target", web::put().to(session::set_target))
                    .route("/audio/start", web::post().to(session::start_audio))
                    .route("/audio/stop", web::post().to(session::stop_audio))
                    .route("/errors", web::get().to(session::list_errors))
                    .route("/errors/{id}/recover", web::post().to(session::recover))
                    .route("/history", web::get().to(session::history)),
            ),
    )
    .route("/ws/monitor", web::get().to(monitor::monitor_socket))
    .route("/health", web::get().to(crate::health::health_check));
}

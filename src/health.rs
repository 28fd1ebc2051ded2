//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let snapshot = state.manager.snapshot();
    let stats = state.manager.stats();
    let quality = state.manager.store().quality();

    // A session that gave up is the only unhealthy state; idle is fine.
    let status = if snapshot.status == voice_session::transport::ConnectionState::Failed {
        "degraded"
    } else {
        "healthy"
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-session",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "status": snapshot.status,
            "provider": snapshot.provider,
            "session_id": snapshot.session_id,
            "transport": snapshot.transport,
            "last_event": snapshot.last_event,
            "error": snapshot.error
        },
        "audio": {
            "capture": stats.capture,
            "input_level": stats.input_level,
            "output_level": stats.output_level,
            "buffered_seconds": stats.buffered_seconds
        },
        "quality": quality
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let stats = state.manager.stats();

    let mut endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "monitor_clients": metrics.monitor_clients,
            "endpoints": endpoints
        },
        "audio": {
            "frames_captured": stats.frames_captured,
            "frames_dropped": stats.frames_dropped,
            "frames_sent": stats.frames_sent,
            "frames_skipped": stats.frames_skipped,
            "chunks_played": stats.chunks_played,
            "playback_errors": stats.playback_errors
        },
        "transport": stats.transport,
        "errors_logged": stats.errors_logged,
        "calls_archived": state.manager.store().history().len()
    }))
}

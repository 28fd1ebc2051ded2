//! # Session Control Endpoints
//!
//! Thin HTTP wrappers around [`SessionManager`](voice_session::SessionManager). Every
//! operation answers with the snapshot published after it ran, so a caller never has to
//! poll to see the result.

use crate::{handlers::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use voice_session::session::CallDirection;
use voice_session::Provider;

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub provider: Provider,
}

#[derive(Debug, Deserialize)]
pub struct InstructionsRequest {
    pub instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    pub target: Option<String>,
    #[serde(default)]
    pub direction: CallDirection,
}

fn snapshot_response(state: &AppState) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "snapshot": state.manager.snapshot(),
        "metadata": state.manager.metadata()
    }))
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    snapshot_response(&state)
}

pub async fn connect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.manager.connect().await?;
    Ok(snapshot_response(&state))
}

pub async fn disconnect(state: web::Data<AppState>) -> HttpResponse {
    state.manager.disconnect();
    snapshot_response(&state)
}

pub async fn switch_provider(
    state: web::Data<AppState>,
    body: web::Json<SwitchRequest>,
) -> Result<HttpResponse, AppError> {
    state.manager.switch_provider(body.provider).await?;
    Ok(snapshot_response(&state))
}

pub async fn update_instructions(
    state: web::Data<AppState>,
    body: web::Json<InstructionsRequest>,
) -> HttpResponse {
    let pushed = state.manager.update_instructions(body.into_inner().instructions);
    HttpResponse::Ok().json(json!({
        "pushed_to_provider": pushed,
        "metadata": state.manager.metadata()
    }))
}

pub async fn set_target(state: web::Data<AppState>, body: web::Json<TargetRequest>) -> HttpResponse {
    let TargetRequest { target, direction } = body.into_inner();
    state.manager.set_call_target(target, direction);
    snapshot_response(&state)
}

pub async fn start_audio(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.manager.start_audio()?;
    Ok(HttpResponse::Ok().json(json!({ "audio": state.manager.stats() })))
}

pub async fn stop_audio(state: web::Data<AppState>) -> HttpResponse {
    state.manager.stop_audio();
    HttpResponse::Ok().json(json!({ "audio": state.manager.stats() }))
}

pub async fn list_errors(state: web::Data<AppState>) -> HttpResponse {
    let errors = state.manager.store().errors();
    HttpResponse::Ok().json(json!({
        "count": errors.len(),
        "errors": errors
    }))
}

pub async fn recover(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let raw = path.into_inner();
    let id = Uuid::parse_str(&raw).map_err(|_| AppError::BadRequest(format!("invalid error id '{}'", raw)))?;
    if state.manager.store().error(id).is_none() {
        return Err(AppError::NotFound(format!("no logged error with id {}", id)));
    }
    state.manager.recover(id).await?;
    Ok(snapshot_response(&state))
}

pub async fn history(state: web::Data<AppState>) -> HttpResponse {
    let calls = state.manager.store().history();
    HttpResponse::Ok().json(json!({
        "count": calls.len(),
        "calls": calls
    }))
}

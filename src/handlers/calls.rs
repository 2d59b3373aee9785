//! # Call Control Endpoints
//!
//! HTTP surface of the call controller, mounted under `/api/v1/calls`.
//!
//! ## Endpoints:
//! - `GET /`: current call view
//! - `POST /`: start a call; answers `202 Accepted` with the `dialing` view
//!   while initiation continues in the background
//! - `POST /hangup`, `/redial`, `/close`: lifecycle operations
//! - `POST /mute`, `/hold`, `/speaker`: toggle a control on the active call
//! - `POST /status`: carrier status webhook
//!
//! Every call response body is the flattened call view, e.g.
//! `{"status": "connected", "phoneNumber": "...", "showCallUI": true, ...}`.

use crate::call::{CallControl, CallEventKind, CallRequest};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

pub async fn get_call(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.calls.snapshot())
}

pub async fn initiate_call(
    state: web::Data<AppState>,
    body: web::Json<CallRequest>,
) -> AppResult<HttpResponse> {
    let pending = state.calls.initiate_call(body.into_inner())?;
    actix_web::rt::spawn(pending);

    Ok(HttpResponse::Accepted().json(state.calls.snapshot()))
}

pub async fn hangup_call(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let view = state.calls.hangup_call().await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn redial_call(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    match state.calls.redial()? {
        Some(pending) => {
            actix_web::rt::spawn(pending);
            Ok(HttpResponse::Accepted().json(state.calls.snapshot()))
        }
        None => Ok(HttpResponse::Ok().json(state.calls.snapshot())),
    }
}

pub async fn close_call_ui(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.calls.close_call_ui())
}

async fn toggle(state: &AppState, control: CallControl) -> AppResult<HttpResponse> {
    let enabled = state.calls.toggle(control).await?;
    Ok(HttpResponse::Ok().json(json!({
        "control": control.as_str(),
        "enabled": enabled,
        "call": state.calls.snapshot()
    })))
}

pub async fn toggle_mute(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    toggle(&state, CallControl::Mute).await
}

pub async fn toggle_hold(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    toggle(&state, CallControl::Hold).await
}

pub async fn toggle_speaker(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    toggle(&state, CallControl::Speaker).await
}

/// Carrier status callback body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCallback {
    pub call_sid: String,
    pub event: CallEventKind,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn call_status_webhook(
    state: web::Data<AppState>,
    body: web::Json<StatusCallback>,
) -> AppResult<HttpResponse> {
    let callback = body.into_inner();
    let feed = state.call_events.as_ref().ok_or_else(|| {
        AppError::NotFound("status webhook is disabled (calls.status_feed = simulated)".to_string())
    })?;

    debug!(call_sid = %callback.call_sid, event = ?callback.event, "Carrier status callback");
    if !feed.publish(&callback.call_sid, callback.event, callback.reason) {
        return Err(AppError::NotFound(format!(
            "no call is waiting for events on {}",
            callback.call_sid
        )));
    }

    info!(call_sid = %callback.call_sid, event = ?callback.event, "Carrier status delivered");
    Ok(HttpResponse::Accepted().json(json!({ "delivered": true })))
}

//! # Configuration Endpoints
//!
//! - `GET /api/v1/config`: current settings
//! - `PUT /api/v1/config`: partial update, e.g. `{"sessions": {"client_timeout_secs": 60}}`
//!
//! Updates are validated before they replace the stored settings. Values read
//! when a channel or call starts (heartbeat, client timeout) apply to new
//! channels; the registry limit and the call backends are fixed at startup.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;
    info!("Configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    fn app_state() -> AppState {
        AppState::new(AppConfig::default()).unwrap()
    }

    #[actix_web::test]
    async fn test_get_config_returns_sections() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["server"]["port"], 8080);
        assert_eq!(body["config"]["sessions"]["reconnect_policy"], "fresh");
        assert_eq!(body["config"]["assistant"]["kind"], "echo");
    }

    #[actix_web::test]
    async fn test_update_config_validates() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"sessions": {"client_timeout_secs": 60}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.get_config().sessions.client_timeout_secs, 60);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"server": {"port": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().server.port, 8080);
    }
}

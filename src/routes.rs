use crate::{handlers, health, websocket};
use actix_web::web;

/// Register every route of the service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config))
            .service(
                web::scope("/calls")
                    .route("", web::get().to(handlers::get_call))
                    .route("", web::post().to(handlers::initiate_call))
                    .route("/hangup", web::post().to(handlers::hangup_call))
                    .route("/redial", web::post().to(handlers::redial_call))
                    .route("/close", web::post().to(handlers::close_call_ui))
                    .route("/mute", web::post().to(handlers::toggle_mute))
                    .route("/hold", web::post().to(handlers::toggle_hold))
                    .route("/speaker", web::post().to(handlers::toggle_speaker))
                    .route("/status", web::post().to(handlers::call_status_webhook)),
            ),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws/session", web::get().to(websocket::session_websocket));
}

//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a summary of every subsystem
//! - `GET /api/v1/metrics`: request counters, per-endpoint timings, channel and
//!   session gauges

use crate::config::AppConfig;
use crate::session::registry::RegistrySummary;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.sessions.summary();
    let call = state.calls.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "active_channels": metrics.active_channels
        },
        "memory": get_memory_info(),
        "sessions": sessions,
        "assistant": {
            "kind": config.assistant.kind,
        },
        "calls": {
            "status": call.state.status,
            "show_call_ui": call.show_call_ui,
            "status_feed": config.calls.status_feed
        },
        "system": get_system_status(&sessions, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config: AppConfig = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
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
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "channels": {
            "active": metrics.active_channels,
            "total": metrics.total_channels,
            "protocol_errors": metrics.protocol_errors
        },
        "sessions": state.sessions.summary(),
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.sessions.max_concurrent_sessions,
            "client_timeout_secs": config.sessions.client_timeout_secs,
            "pending_call_timeout_ms": config.calls.pending_timeout_ms
        }
    }))
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let path = format!("/proc/{}/status", std::process::id());
    let Ok(status) = std::fs::read_to_string(path) else {
        return memory_unavailable("Could not read /proc status");
    };

    let field_bytes = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map_or(0, |kb| kb * 1024)
    };

    json!({
        "resident_memory_bytes": field_bytes("VmRSS:"),
        "virtual_memory_bytes": field_bytes("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    memory_unavailable("Memory info not available on this platform")
}

fn memory_unavailable(note: &str) -> serde_json::Value {
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": note
    })
}

fn get_system_status(sessions: &RegistrySummary, metrics: &AppMetrics) -> serde_json::Value {
    let session_usage = if sessions.max_sessions > 0 {
        sessions.attached_sessions as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": sessions.max_sessions,
        "current_sessions": sessions.attached_sessions,
        "open_channels": metrics.active_channels,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing sessions.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

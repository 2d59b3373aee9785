//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: current settings, replaceable at runtime via `PUT /api/v1/config`
//! - **metrics**: request counters and channel gauges for `/api/v1/metrics`
//! - **sessions**: the session registry backing every `/ws/session` channel
//! - **assistant**: the reply backend for user messages
//! - **calls**: the call controller driven by `/api/v1/calls`
//!
//! Cloning is cheap: every field is an `Arc` or a handle wrapping one.

use crate::call::{
    CallController, CallStatusFeed, CallTimings, HttpCallInitiator, HttpCallTransport,
    SimulatedStatusFeed, WebhookStatusFeed,
};
use crate::config::{AppConfig, StatusFeedKind};
use crate::session::{assistant, Assistant, SessionRegistry};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub sessions: Arc<SessionRegistry>,
    pub assistant: Arc<dyn Assistant>,
    pub calls: CallController,
    /// Present when carrier events arrive through the status webhook.
    pub call_events: Option<Arc<WebhookStatusFeed>>,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// WebSocket channels currently connected.
    pub active_channels: u32,
    pub total_channels: u64,
    /// `error` envelopes sent on session channels.
    pub protocol_errors: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build every subsystem from configuration.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let sessions = Arc::new(SessionRegistry::new(
            config.sessions.max_concurrent_sessions,
            config.sessions.reconnect_policy,
            config.sessions.idle_timeout(),
        ));
        let assistant = assistant::from_config(&config.assistant)?;

        let calls_config = &config.calls;
        let initiator = Arc::new(HttpCallInitiator::new(
            calls_config.initiation_url.clone(),
            calls_config.request_timeout(),
        )?);
        let transport = Arc::new(HttpCallTransport::new(
            calls_config.control_url.clone(),
            calls_config.request_timeout(),
        )?);

        let call_events = match calls_config.status_feed {
            StatusFeedKind::Webhook => Some(Arc::new(WebhookStatusFeed::new())),
            StatusFeedKind::Simulated => None,
        };
        let feed: Arc<dyn CallStatusFeed> = match &call_events {
            Some(webhook) => webhook.clone(),
            None => Arc::new(SimulatedStatusFeed::new(calls_config.simulated_answer())),
        };

        let timings = CallTimings {
            pending_timeout: calls_config.pending_timeout(),
            ended_reset: calls_config.ended_reset(),
        };
        let calls = CallController::new(initiator, transport, feed, timings);

        info!(
            assistant = ?config.assistant.kind,
            status_feed = ?calls_config.status_feed,
            reconnect_policy = config.sessions.reconnect_policy.as_str(),
            "Application state initialized"
        );

        Ok(Self::from_parts(config, sessions, assistant, calls, call_events))
    }

    /// Assemble state from prebuilt parts.
    pub fn from_parts(
        config: AppConfig,
        sessions: Arc<SessionRegistry>,
        assistant: Arc<dyn Assistant>,
        calls: CallController,
        call_events: Option<Arc<WebhookStatusFeed>>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
            assistant,
            calls,
            call_events,
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn channel_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_channels += 1;
        metrics.total_channels += 1;
    }

    pub fn channel_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_channels = metrics.active_channels.saturating_sub(1);
    }

    pub fn record_protocol_error(&self) {
        self.metrics_mut().protocol_errors += 1;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_builds_from_default_config() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert!(state.call_events.is_some());
        assert_eq!(state.sessions.active_count(), 0);
        assert!(!state.calls.show_call_ui());
    }

    #[tokio::test]
    async fn test_simulated_feed_has_no_webhook() {
        let mut config = AppConfig::default();
        config.calls.status_feed = StatusFeedKind::Simulated;
        let state = AppState::new(config).unwrap();
        assert!(state.call_events.is_none());
    }

    #[tokio::test]
    async fn test_channel_gauge_never_underflows() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.channel_opened();
        state.channel_closed();
        state.channel_closed();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_channels, 0);
        assert_eq!(metrics.total_channels, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let mut config = state.get_config();
        config.server.port = 0;

        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }
}

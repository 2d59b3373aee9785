//! # Configuration Management
//!
//! Settings are layered from several sources:
//! - Default values (the `Default` impls below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix; nested keys use `__`
//!   (`APP_SESSIONS__MAX_CONCURRENT_SESSIONS=50`)
//! - `HOST` / `PORT`, as set by most deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Built-in defaults
//!
//! Sections map one-to-one onto subsystems: `server` for the HTTP listener,
//! `sessions` for the WebSocket session channel, `assistant` for the reply
//! backend and `calls` for the call controller.

use crate::session::ReconnectPolicy;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub assistant: AssistantConfig,
    pub calls: CallsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Session channel limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions attached to a live channel at the same time.
    pub max_concurrent_sessions: usize,
    pub reconnect_policy: ReconnectPolicy,
    /// Interval between server ping frames.
    pub heartbeat_interval_secs: u64,
    /// A channel with no client traffic for this long is stopped.
    pub client_timeout_secs: u64,
    /// Detached sessions are swept after this long (resume policy only).
    pub idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            reconnect_policy: ReconnectPolicy::Fresh,
            heartbeat_interval_secs: 5,
            client_timeout_secs: 30,
            idle_timeout_secs: 300,
            cleanup_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantKind {
    /// Built-in acknowledgement replies, no external service.
    #[default]
    Echo,
    /// POST each turn to `assistant.endpoint`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub kind: AssistantKind,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            kind: AssistantKind::Echo,
            endpoint: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFeedKind {
    /// Carrier posts events to `/api/v1/calls/status`.
    #[default]
    Webhook,
    /// Report every accepted call answered after `simulated_answer_ms`.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    pub initiation_url: String,
    pub control_url: String,
    pub status_feed: StatusFeedKind,
    pub pending_timeout_ms: u64,
    pub ended_reset_ms: u64,
    pub simulated_answer_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            initiation_url: "http://127.0.0.1:3000/api/calls/initiate".to_string(),
            control_url: "http://127.0.0.1:3000/api/calls/control".to_string(),
            status_feed: StatusFeedKind::Webhook,
            pending_timeout_ms: 30_000,
            ended_reset_ms: 2_000,
            simulated_answer_ms: 2_000,
            request_timeout_secs: 15,
        }
    }
}

impl CallsConfig {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn ended_reset(&self) -> Duration {
        Duration::from_millis(self.ended_reset_ms)
    }

    pub fn simulated_answer(&self) -> Duration {
        Duration::from_millis(self.simulated_answer_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Load the layered configuration.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        let sessions = &self.sessions;
        if sessions.max_concurrent_sessions == 0 {
            bail!("Max concurrent sessions must be greater than 0");
        }
        if sessions.heartbeat_interval_secs == 0 || sessions.client_timeout_secs == 0 {
            bail!("Heartbeat interval and client timeout must be greater than 0");
        }
        if sessions.client_timeout_secs <= sessions.heartbeat_interval_secs {
            bail!("Client timeout must be longer than the heartbeat interval");
        }
        if sessions.cleanup_interval_secs == 0 {
            bail!("Cleanup interval must be greater than 0");
        }

        if self.assistant.timeout_secs == 0 {
            bail!("Assistant timeout must be greater than 0");
        }
        if self.assistant.kind == AssistantKind::Http && self.assistant.endpoint.trim().is_empty() {
            bail!("The http assistant requires assistant.endpoint");
        }

        let calls = &self.calls;
        if calls.pending_timeout_ms == 0 || calls.request_timeout_secs == 0 {
            bail!("Call timeouts must be greater than 0");
        }
        if calls.initiation_url.trim().is_empty() || calls.control_url.trim().is_empty() {
            bail!("Call initiation and control URLs are required");
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current settings.
    ///
    /// Only keys present in `json_str` change. The update is all-or-nothing:
    /// if the merged result fails to parse or validate, `self` is untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            bail!("Configuration update must be a JSON object");
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge(&mut merged, patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

//! Capability for controlling an active call on the carrier side.

use crate::call::error::CallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Side-channel controls that do not change the call's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallControl {
    Mute,
    Hold,
    Speaker,
}

impl CallControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallControl::Mute => "mute",
            CallControl::Hold => "hold",
            CallControl::Speaker => "speaker",
        }
    }
}

#[async_trait]
pub trait ActiveCallTransport: Send + Sync {
    /// Switch a control on or off for the call.
    async fn apply(&self, call_sid: &str, control: CallControl, enabled: bool)
        -> Result<(), CallError>;

    /// Tear the call down at the carrier.
    async fn hang_up(&self, call_sid: &str) -> Result<(), CallError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest<'a> {
    call_sid: &'a str,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
}

/// Posts `{callSid, action, enabled}` to the telephony control endpoint.
#[derive(Debug, Clone)]
pub struct HttpCallTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpCallTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, body: &ControlRequest<'_>) -> Result<(), CallError> {
        debug!(url = %self.url, call_sid = body.call_sid, action = body.action, "Sending call control");

        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CallError::Transport(format!(
                "{} rejected with {}",
                body.action,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl ActiveCallTransport for HttpCallTransport {
    async fn apply(
        &self,
        call_sid: &str,
        control: CallControl,
        enabled: bool,
    ) -> Result<(), CallError> {
        self.post(&ControlRequest {
            call_sid,
            action: control.as_str(),
            enabled: Some(enabled),
        })
        .await
    }

    async fn hang_up(&self, call_sid: &str) -> Result<(), CallError> {
        self.post(&ControlRequest {
            call_sid,
            action: "hangup",
            enabled: None,
        })
        .await
    }
}

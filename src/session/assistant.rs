//! Assistant backends that produce replies for session turns.
//!
//! The assistant's reasoning is opaque to the protocol: it receives the
//! session's metadata, transcript and the message to answer, and returns text.

use crate::config::{AssistantConfig, AssistantKind};
use crate::session::envelope::Role;
use crate::session::registry::TranscriptEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Context handed to the assistant for one user message.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantTurn {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub metadata: Value,
    /// The user message being answered.
    pub message: String,
    /// Transcript as of the moment the turn is processed.
    pub transcript: Vec<TranscriptEntry>,
}

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(String),

    #[error("assistant responded with HTTP {0}")]
    Status(u16),

    #[error("assistant returned an empty reply")]
    EmptyReply,
}

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn reply(&self, turn: &AssistantTurn) -> Result<String, AssistantError>;
}

/// Built-in assistant for development and tests: acknowledges each message.
#[derive(Debug, Default, Clone)]
pub struct EchoAssistant;

#[async_trait]
impl Assistant for EchoAssistant {
    async fn reply(&self, turn: &AssistantTurn) -> Result<String, AssistantError> {
        let greeting = turn
            .metadata
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("Thanks, {}. ", name))
            .unwrap_or_default();
        let earlier = turn
            .transcript
            .iter()
            .filter(|entry| entry.role == Role::User)
            .count()
            .saturating_sub(1);

        Ok(format!(
            "{}You said: {} ({} earlier message{})",
            greeting,
            turn.message,
            earlier,
            if earlier == 1 { "" } else { "s" }
        ))
    }
}

#[derive(Debug, Deserialize)]
struct HttpReply {
    reply: String,
}

/// Assistant reached over HTTP: `POST {sessionId, metadata, message, transcript}`,
/// expects `{"reply": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpAssistant {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAssistant {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssistantError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn reply(&self, turn: &AssistantTurn) -> Result<String, AssistantError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(turn)
            .send()
            .await
            .map_err(|e| AssistantError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AssistantError::Status(response.status().as_u16()));
        }

        let body: HttpReply = response
            .json()
            .await
            .map_err(|e| AssistantError::Request(e.to_string()))?;

        if body.reply.trim().is_empty() {
            return Err(AssistantError::EmptyReply);
        }
        Ok(body.reply)
    }
}

/// Build the configured assistant backend.
pub fn from_config(config: &AssistantConfig) -> anyhow::Result<Arc<dyn Assistant>> {
    match config.kind {
        AssistantKind::Echo => Ok(Arc::new(EchoAssistant)),
        AssistantKind::Http => {
            let assistant =
                HttpAssistant::new(config.endpoint.clone(), Duration::from_secs(config.timeout_secs))?;
            Ok(Arc::new(assistant))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn turn(message: &str, earlier: &[&str]) -> AssistantTurn {
        let mut transcript: Vec<TranscriptEntry> = earlier
            .iter()
            .map(|content| TranscriptEntry {
                role: Role::User,
                content: content.to_string(),
                at: Utc::now(),
            })
            .collect();
        transcript.push(TranscriptEntry {
            role: Role::User,
            content: message.to_string(),
            at: Utc::now(),
        });

        AssistantTurn {
            session_id: "s1".to_string(),
            metadata: json!({"name": "Ada"}),
            message: message.to_string(),
            transcript,
        }
    }

    #[tokio::test]
    async fn test_echo_reply_is_never_empty() {
        let reply = EchoAssistant.reply(&turn("hello", &[])).await.unwrap();
        assert_eq!(reply, "Thanks, Ada. You said: hello (0 earlier messages)");
    }

    #[tokio::test]
    async fn test_echo_counts_earlier_user_messages() {
        let reply = EchoAssistant.reply(&turn("third", &["one", "two"])).await.unwrap();
        assert!(reply.ends_with("(2 earlier messages)"));
    }

    #[test]
    fn test_turn_serializes_camel_case_session_id() {
        let value = serde_json::to_value(turn("hi", &[])).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["transcript"][0]["role"], "user");
    }

    #[test]
    fn test_from_config_builds_echo_by_default() {
        assert!(from_config(&AssistantConfig::default()).is_ok());
    }
}

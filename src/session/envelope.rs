//! # Session Envelopes
//!
//! The JSON unit exchanged over a session channel. Every envelope carries a
//! `type` discriminator so a receiver can dispatch without any other context.
//!
//! ## Wire format:
//! - `init`: `{"type":"init","sessionId"?,"metadata"}` (`data` accepted for `metadata`)
//! - `welcome`: `{"type":"welcome","sessionId","resumed"}`
//! - `message`: `{"type":"message","sessionId","role"?,"content"}` (`message` accepted for `content`)
//! - `error`: `{"type":"error","sessionId"?,"code","message"}`
//!
//! Aliases are only accepted on input; outbound envelopes always use the
//! canonical field names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Envelope `type` values this protocol understands.
const KNOWN_TYPES: [&str; 4] = ["init", "welcome", "message", "error"];

/// Author of a transcript entry or message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Begins (or resumes) a session. Must be the first envelope on a channel.
    Init {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default = "empty_metadata", alias = "data")]
        metadata: Value,
    },

    /// Server acknowledgement carrying the canonical session id.
    Welcome {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },

    /// A conversational turn. Clients may omit `role`; it is then `user`.
    Message {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(alias = "message")]
        content: String,
    },

    /// Protocol-level failure report.
    Error {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        code: String,
        message: String,
    },
}

fn empty_metadata() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    /// Parse an inbound text frame.
    ///
    /// The payload is decoded in two steps so a missing or unknown `type`
    /// is reported with its own code instead of a generic serde message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

        let Some(object) = value.as_object() else {
            return Err(ProtocolError::InvalidEnvelope(
                "envelope must be a JSON object".to_string(),
            ));
        };

        match object.get("type") {
            None => return Err(ProtocolError::MissingType),
            Some(Value::String(kind)) if !KNOWN_TYPES.contains(&kind.as_str()) => {
                return Err(ProtocolError::UnknownType(kind.clone()));
            }
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(ProtocolError::InvalidEnvelope(
                    "`type` must be a string".to_string(),
                ));
            }
        }

        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidEnvelope(err.to_string()))
    }

    /// Encode for sending as a text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Init { .. } => "init",
            Envelope::Welcome { .. } => "welcome",
            Envelope::Message { .. } => "message",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::Init { session_id, .. }
            | Envelope::Message { session_id, .. }
            | Envelope::Error { session_id, .. } => session_id.as_deref(),
            Envelope::Welcome { session_id, .. } => Some(session_id),
        }
    }

    pub fn welcome(session_id: impl Into<String>, resumed: bool) -> Self {
        Envelope::Welcome {
            session_id: session_id.into(),
            resumed,
        }
    }

    pub fn user_message(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope::Message {
            session_id: Some(session_id.into()),
            role: Some(Role::User),
            content: content.into(),
        }
    }

    pub fn assistant_reply(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope::Message {
            session_id: Some(session_id.into()),
            role: Some(Role::Assistant),
            content: content.into(),
        }
    }

    pub fn error(session_id: Option<String>, err: &ProtocolError) -> Self {
        Envelope::Error {
            session_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Protocol violations reported back to the sender as `error` envelopes.
/// None of these terminate the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("envelope is missing the `type` field")]
    MissingType,

    #[error("unknown envelope type `{0}`")]
    UnknownType(String),

    #[error("session already initialized on this channel")]
    DuplicateInit,

    #[error("session not initialized; send `init` and wait for `welcome` first")]
    NotInitialized,

    #[error("unknown session id {}", .0.as_deref().unwrap_or("(none)"))]
    UnknownSession(Option<String>),

    #[error("unexpected {0} from client")]
    UnexpectedMessage(String),

    #[error("message content must not be empty")]
    EmptyContent,

    #[error("binary frames are not supported")]
    UnsupportedFrame,

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("session `{0}` is attached to another channel")]
    SessionInUse(String),

    #[error("session `{0}` is closed")]
    SessionClosed(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("assistant failed: {0}")]
    Assistant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Machine-readable code carried in the `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::InvalidEnvelope(_) => "invalid_envelope",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::DuplicateInit => "duplicate_init",
            ProtocolError::NotInitialized => "not_initialized",
            ProtocolError::UnknownSession(_) => "unknown_session",
            ProtocolError::UnexpectedMessage(_) => "unexpected_message",
            ProtocolError::EmptyContent => "empty_content",
            ProtocolError::UnsupportedFrame => "unsupported_frame",
            ProtocolError::SessionLimit(_) => "session_limit",
            ProtocolError::SessionInUse(_) => "session_in_use",
            ProtocolError::SessionClosed(_) => "session_closed",
            ProtocolError::InvalidSessionId(_) => "invalid_session_id",
            ProtocolError::Assistant(_) => "assistant_error",
            ProtocolError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_accepts_data_alias() {
        let envelope =
            Envelope::parse(r#"{"type":"init","data":{"hostname":"example.com","startMessage":"hi"}}"#)
                .unwrap();

        match envelope {
            Envelope::Init { session_id, metadata } => {
                assert_eq!(session_id, None);
                assert_eq!(metadata["hostname"], "example.com");
            }
            other => panic!("Wrong envelope: {:?}", other),
        }
    }

    #[test]
    fn test_init_without_metadata_defaults_to_empty_object() {
        let envelope = Envelope::parse(r#"{"type":"init","sessionId":"s1"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::Init {
                session_id: Some("s1".to_string()),
                metadata: json!({}),
            }
        );
    }

    #[test]
    fn test_message_alias_normalizes_to_content() {
        let envelope =
            Envelope::parse(r#"{"type":"message","sessionId":"s1","message":"hello"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::Message {
                session_id: Some("s1".to_string()),
                role: None,
                content: "hello".to_string(),
            }
        );

        let text = Envelope::assistant_reply("s1", "hi there").to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "hi there");
        assert_eq!(value["sessionId"], "s1");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_welcome_uses_camel_case_session_id() {
        let text = Envelope::welcome("abc", false).to_text().unwrap();
        assert!(text.contains(r#""type":"welcome""#));
        assert!(text.contains(r#""sessionId":"abc""#));
    }

    #[test]
    fn test_malformed_payloads_map_to_codes() {
        assert_eq!(Envelope::parse("{not json").unwrap_err().code(), "invalid_json");
        assert_eq!(Envelope::parse("[1,2]").unwrap_err().code(), "invalid_envelope");
        assert_eq!(
            Envelope::parse(r#"{"sessionId":"s1"}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert_eq!(
            Envelope::parse(r#"{"type":"ping"}"#).unwrap_err(),
            ProtocolError::UnknownType("ping".to_string())
        );
        assert_eq!(
            Envelope::parse(r#"{"type":"message","sessionId":"s1"}"#)
                .unwrap_err()
                .code(),
            "invalid_envelope"
        );
    }

    #[test]
    fn test_error_envelope_carries_code_and_reason() {
        let envelope = Envelope::error(Some("s1".to_string()), &ProtocolError::DuplicateInit);
        let value: Value = serde_json::from_str(&envelope.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "duplicate_init");
        assert_eq!(value["sessionId"], "s1");
        assert!(!value["message"].as_str().unwrap().is_empty());
    }
}

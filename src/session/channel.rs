//! # Channel Protocol
//!
//! Per-connection protocol state: decides what each inbound text frame does,
//! independent of the WebSocket transport that carries it.
//!
//! ## States:
//! 1. **Uninitialized**: only `init` is accepted
//! 2. **Active**: holds a [`SessionLease`]; `message` envelopes become assistant turns
//! 3. **Closed**: the lease is released; nothing further is accepted
//!
//! Every violation becomes an `error` envelope and leaves the channel open.

use crate::session::assistant::AssistantTurn;
use crate::session::envelope::{Envelope, ProtocolError, Role};
use crate::session::registry::{SessionError, SessionLease, SessionRegistry};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// An accepted user message waiting for its assistant reply.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub lease: SessionLease,
    pub message: String,
}

impl PendingTurn {
    /// Record the user entry and snapshot the transcript up to and including
    /// it. Turns are started one at a time, so the snapshot never holds
    /// messages sent after this one.
    pub fn begin(&self) -> Result<AssistantTurn, SessionError> {
        let len = self.lease.append(Role::User, self.message.as_str())?;
        let mut transcript = self.lease.transcript();
        transcript.truncate(len);

        Ok(AssistantTurn {
            session_id: self.lease.session_id().to_string(),
            metadata: self.lease.metadata().clone(),
            message: self.message.clone(),
            transcript,
        })
    }
}

/// What the transport should do with an inbound frame.
#[derive(Debug)]
pub enum Inbound {
    /// Send this envelope straight back.
    Reply(Envelope),
    /// Queue the turn for the assistant worker.
    Turn(PendingTurn),
}

impl From<SessionError> for ProtocolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::LimitReached(max) => ProtocolError::SessionLimit(max),
            SessionError::InUse(id) => ProtocolError::SessionInUse(id),
            SessionError::Closed(id) => ProtocolError::SessionClosed(id),
            SessionError::BlankId => ProtocolError::InvalidSessionId(err.to_string()),
        }
    }
}

#[derive(Debug)]
enum ChannelState {
    Uninitialized,
    Active(SessionLease),
    Closed,
}

/// Protocol state machine for one session channel.
#[derive(Debug)]
pub struct ChannelProtocol {
    registry: Arc<SessionRegistry>,
    state: ChannelState,
}

impl ChannelProtocol {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            state: ChannelState::Uninitialized,
        }
    }

    /// The canonical session id once `welcome` has been issued.
    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Active(lease) => Some(lease.session_id()),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ChannelState::Active(_))
    }

    /// Handle one inbound text frame.
    pub fn handle_text(&mut self, text: &str) -> Inbound {
        match Envelope::parse(text).and_then(|envelope| self.dispatch(envelope)) {
            Ok(inbound) => inbound,
            Err(err) => Inbound::Reply(self.reject(err)),
        }
    }

    /// Build the `error` envelope for a violation and log it.
    pub fn reject(&self, err: ProtocolError) -> Envelope {
        let session_id = self.session_id().map(str::to_owned);
        warn!(
            session_id = session_id.as_deref().unwrap_or("-"),
            code = err.code(),
            "Protocol error: {}",
            err
        );
        Envelope::error(session_id, &err)
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<Inbound, ProtocolError> {
        match envelope {
            Envelope::Init {
                session_id,
                metadata,
            } => self.init(session_id, metadata),
            Envelope::Message {
                session_id,
                role,
                content,
            } => self.user_message(session_id, role, content),
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "`{}` envelope",
                other.kind()
            ))),
        }
    }

    fn init(
        &mut self,
        requested_id: Option<String>,
        metadata: Value,
    ) -> Result<Inbound, ProtocolError> {
        match self.state {
            ChannelState::Uninitialized => {}
            ChannelState::Active(_) => return Err(ProtocolError::DuplicateInit),
            ChannelState::Closed => {
                return Err(ProtocolError::Internal("channel is closed".to_string()))
            }
        }

        let opened = self.registry.open(requested_id, metadata)?;
        let welcome = Envelope::welcome(opened.lease.session_id(), opened.resumed);
        debug!(session_id = opened.lease.session_id(), resumed = opened.resumed, "Sending welcome");
        self.state = ChannelState::Active(opened.lease);
        Ok(Inbound::Reply(welcome))
    }

    fn user_message(
        &mut self,
        session_id: Option<String>,
        role: Option<Role>,
        content: String,
    ) -> Result<Inbound, ProtocolError> {
        let lease = match &self.state {
            ChannelState::Active(lease) => lease,
            _ => return Err(ProtocolError::NotInitialized),
        };

        if session_id.as_deref() != Some(lease.session_id()) {
            return Err(ProtocolError::UnknownSession(session_id));
        }
        if role == Some(Role::Assistant) {
            return Err(ProtocolError::UnexpectedMessage(
                "assistant-role message".to_string(),
            ));
        }
        if content.trim().is_empty() {
            return Err(ProtocolError::EmptyContent);
        }

        if !lease.is_current() {
            return Err(SessionError::Closed(lease.session_id().to_string()).into());
        }
        Ok(Inbound::Turn(PendingTurn {
            lease: lease.clone(),
            message: content,
        }))
    }

    /// Release the session. Safe to call more than once.
    pub fn close(&mut self) -> bool {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Active(lease) => self.registry.release(&lease),
            _ => false,
        }
    }
}

impl Drop for ChannelProtocol {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::ReconnectPolicy;
    use std::time::Duration;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            4,
            ReconnectPolicy::Fresh,
            Duration::from_secs(60),
        ))
    }

    fn expect_reply(inbound: Inbound) -> Envelope {
        match inbound {
            Inbound::Reply(envelope) => envelope,
            Inbound::Turn(turn) => panic!("Expected reply, got turn {:?}", turn.message),
        }
    }

    fn expect_error_code(inbound: Inbound) -> String {
        match expect_reply(inbound) {
            Envelope::Error { code, .. } => code,
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_init_then_message_produces_turn() {
        let mut channel = ChannelProtocol::new(registry());

        let welcome = expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1","metadata":{"name":"Ada"}}"#));
        assert_eq!(welcome, Envelope::welcome("s1", false));

        match channel.handle_text(r#"{"type":"message","sessionId":"s1","content":"hello"}"#) {
            Inbound::Turn(turn) => {
                assert_eq!(turn.message, "hello");
                let context = turn.begin().unwrap();
                assert_eq!(context.session_id, "s1");
                assert_eq!(context.metadata["name"], "Ada");
                assert_eq!(context.transcript.len(), 1);
            }
            Inbound::Reply(envelope) => panic!("Expected turn, got {:?}", envelope),
        }
    }

    #[test]
    fn test_duplicate_init_does_not_mint_second_session() {
        let registry = registry();
        let mut channel = ChannelProtocol::new(registry.clone());

        expect_reply(channel.handle_text(r#"{"type":"init"}"#));
        let first_id = channel.session_id().unwrap().to_string();

        assert_eq!(expect_error_code(channel.handle_text(r#"{"type":"init"}"#)), "duplicate_init");
        assert_eq!(channel.session_id(), Some(first_id.as_str()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_message_before_welcome_is_rejected_on_every_retry() {
        let registry = registry();
        let mut channel = ChannelProtocol::new(registry.clone());
        let frame = r#"{"type":"message","sessionId":"s1","content":"hello"}"#;

        for _ in 0..3 {
            assert_eq!(expect_error_code(channel.handle_text(frame)), "not_initialized");
        }
        assert!(!channel.is_initialized());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_foreign_session_id_is_rejected() {
        let registry = registry();
        let mut other = ChannelProtocol::new(registry.clone());
        expect_reply(other.handle_text(r#"{"type":"init","sessionId":"other"}"#));

        let mut channel = ChannelProtocol::new(registry);
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"mine"}"#));

        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"message","sessionId":"other","content":"hi"}"#)),
            "unknown_session"
        );
        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"message","content":"hi"}"#)),
            "unknown_session"
        );
    }

    #[test]
    fn test_violations_leave_channel_usable() {
        let mut channel = ChannelProtocol::new(registry());
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        assert_eq!(expect_error_code(channel.handle_text("not json")), "invalid_json");
        assert_eq!(expect_error_code(channel.handle_text(r#"{"sessionId":"s1"}"#)), "missing_type");
        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"welcome","sessionId":"s1"}"#)),
            "unexpected_message"
        );
        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"message","sessionId":"s1","role":"assistant","content":"x"}"#)),
            "unexpected_message"
        );
        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"message","sessionId":"s1","content":"   "}"#)),
            "empty_content"
        );

        assert!(matches!(
            channel.handle_text(r#"{"type":"message","sessionId":"s1","message":"still here"}"#),
            Inbound::Turn(_)
        ));
    }

    #[test]
    fn test_error_envelope_names_session_once_active() {
        let mut channel = ChannelProtocol::new(registry());
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        match expect_reply(channel.handle_text("{")) {
            Envelope::Error { session_id, .. } => assert_eq!(session_id.as_deref(), Some("s1")),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_session_in_use_by_other_channel() {
        let registry = registry();
        let mut first = ChannelProtocol::new(registry.clone());
        expect_reply(first.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        let mut second = ChannelProtocol::new(registry);
        assert_eq!(
            expect_error_code(second.handle_text(r#"{"type":"init","sessionId":"s1"}"#)),
            "session_in_use"
        );
        assert!(!second.is_initialized());
    }

    #[test]
    fn test_close_freezes_transcript_for_pending_turns() {
        let registry = registry();
        let mut channel = ChannelProtocol::new(registry.clone());
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        let turn = match channel.handle_text(r#"{"type":"message","sessionId":"s1","content":"hello"}"#) {
            Inbound::Turn(turn) => turn,
            Inbound::Reply(envelope) => panic!("Expected turn, got {:?}", envelope),
        };

        assert_eq!(turn.begin().unwrap().transcript.len(), 1);

        assert!(channel.close());
        assert!(!channel.close());
        assert!(turn.lease.append(Role::Assistant, "late").is_err());
        assert!(turn.begin().is_err());
        assert_eq!(turn.lease.transcript().len(), 1);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_queued_turn_is_recorded_only_when_started() {
        let registry = registry();
        let mut channel = ChannelProtocol::new(registry.clone());
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        let mut turns = Vec::new();
        for content in ["one", "two"] {
            let frame = format!(r#"{{"type":"message","sessionId":"s1","content":"{}"}}"#, content);
            match channel.handle_text(&frame) {
                Inbound::Turn(turn) => turns.push(turn),
                Inbound::Reply(envelope) => panic!("Expected turn, got {:?}", envelope),
            }
        }
        assert!(turns[0].lease.transcript().is_empty());

        let first = turns[0].begin().unwrap();
        let contents: Vec<_> = first.transcript.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["one"]);
        turns[0].lease.append(Role::Assistant, "re: one").unwrap();

        let second = turns[1].begin().unwrap();
        let contents: Vec<_> = second.transcript.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "re: one", "two"]);
    }

    #[test]
    fn test_message_after_release_is_rejected() {
        let registry = registry();
        let mut channel = ChannelProtocol::new(registry.clone());
        expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));

        let lease = match channel.handle_text(r#"{"type":"message","sessionId":"s1","content":"hi"}"#) {
            Inbound::Turn(turn) => turn.lease,
            Inbound::Reply(envelope) => panic!("Expected turn, got {:?}", envelope),
        };
        assert!(registry.release(&lease));

        assert_eq!(
            expect_error_code(channel.handle_text(r#"{"type":"message","sessionId":"s1","content":"hi"}"#)),
            "session_closed"
        );
    }

    #[test]
    fn test_drop_releases_session() {
        let registry = registry();
        {
            let mut channel = ChannelProtocol::new(registry.clone());
            expect_reply(channel.handle_text(r#"{"type":"init","sessionId":"s1"}"#));
            assert_eq!(registry.active_count(), 1);
        }
        assert_eq!(registry.active_count(), 0);
    }
}

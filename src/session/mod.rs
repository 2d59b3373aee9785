//! # Session Channel
//!
//! The conversational session layer carried over `/ws/session`.
//!
//! ## Key Components:
//! - **Envelope**: typed JSON protocol unit (`init`, `welcome`, `message`, `error`)
//! - **Registry**: keyed store of sessions and their transcripts
//! - **Channel**: per-connection protocol state machine
//! - **Assistant**: backend that answers user messages
//!
//! The WebSocket actor lives in `src/websocket.rs`; the client side of the
//! protocol lives in `src/client.rs`.

pub mod assistant;
pub mod channel;
pub mod envelope;
pub mod registry;

pub use assistant::{Assistant, AssistantTurn, EchoAssistant};
pub use channel::{ChannelProtocol, Inbound, PendingTurn};
pub use envelope::{Envelope, ProtocolError, Role};
pub use registry::{ReconnectPolicy, SessionLease, SessionRegistry};

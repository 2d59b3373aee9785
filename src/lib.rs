//! # Receptionist Backend
//!
//! Backend for an AI receptionist dashboard.
//!
//! ## Application Architecture:
//! - **session**: the conversational session protocol (envelopes, registry, assistant)
//! - **websocket**: the actor carrying a session channel over `/ws/session`
//! - **client**: the client side of the session protocol
//! - **call**: the outbound call state machine and its carrier collaborators
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **handlers**: HTTP handlers for configuration and call control
//! - **routes**: route table shared by the binary and the tests
//! - **error**: HTTP error type and JSON error responses

pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod state;
pub mod websocket;

//! # Session Client
//!
//! Client side of the session channel, used by test harnesses and embedded
//! clients.
//!
//! ## Usage:
//! ```no_run
//! # async fn run() -> Result<(), receptionist_backend::client::ClientError> {
//! use receptionist_backend::client::{SessionClient, DEFAULT_LIVENESS};
//!
//! let mut client = SessionClient::connect("ws://127.0.0.1:8080/ws/session", DEFAULT_LIVENESS).await?;
//! let session_id = client.send_init(serde_json::json!({"name": "Ada"}), None).await?;
//! let reply = client.send_message("What are your opening hours?").await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every wait is bounded by the liveness timeout. When it expires the socket
//! is closed and [`ClientError::Timeout`] is returned; the client is unusable
//! afterwards.

use crate::session::{Envelope, Role};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// How long to wait for the server before giving up on the connection.
pub const DEFAULT_LIVENESS: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("no response from server within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("server reported {code}: {message}")]
    Protocol { code: String, message: String },

    #[error("session not initialized; call send_init first")]
    NotInitialized,

    #[error("session already initialized")]
    AlreadyInitialized,

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct SessionClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    liveness: Duration,
    session_id: Option<String>,
}

impl SessionClient {
    pub async fn connect(url: &str, liveness: Duration) -> Result<Self, ClientError> {
        let deadline = Instant::now() + liveness;
        let (socket, _response) = timeout_at(deadline, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout(liveness))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        debug!(url, "Connected to session channel");
        Ok(Self {
            socket,
            liveness,
            session_id: None,
        })
    }

    /// The id from `welcome`, once received.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send `init` and wait for `welcome`. Returns the canonical session id.
    pub async fn send_init(
        &mut self,
        metadata: Value,
        session_id: Option<String>,
    ) -> Result<String, ClientError> {
        if self.session_id.is_some() {
            return Err(ClientError::AlreadyInitialized);
        }

        self.send_envelope(&Envelope::Init {
            session_id,
            metadata,
        })
        .await?;

        let deadline = Instant::now() + self.liveness;
        loop {
            match self.recv_until(deadline).await? {
                Envelope::Welcome { session_id, .. } => {
                    self.session_id = Some(session_id.clone());
                    return Ok(session_id);
                }
                Envelope::Error { code, message, .. } => {
                    return Err(ClientError::Protocol { code, message })
                }
                other => debug!(kind = other.kind(), "Ignoring envelope while waiting for welcome"),
            }
        }
    }

    /// Send a user message and wait for the assistant reply.
    pub async fn send_message(&mut self, content: &str) -> Result<String, ClientError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(ClientError::NotInitialized)?;

        self.send_envelope(&Envelope::user_message(session_id, content))
            .await?;

        let deadline = Instant::now() + self.liveness;
        loop {
            match self.recv_until(deadline).await? {
                Envelope::Message {
                    role: Some(Role::Assistant),
                    content,
                    ..
                } => return Ok(content),
                Envelope::Error { code, message, .. } => {
                    return Err(ClientError::Protocol { code, message })
                }
                other => debug!(kind = other.kind(), "Ignoring envelope while waiting for reply"),
            }
        }
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = envelope.to_text()?;
        self.send_raw(&text).await
    }

    /// Send a text frame as-is.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.socket.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Wait for the next envelope from the server.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, ClientError> {
        let deadline = Instant::now() + self.liveness;
        self.recv_until(deadline).await
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Envelope, ClientError> {
        loop {
            let frame = match timeout_at(deadline, self.socket.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(liveness = ?self.liveness, "Server unresponsive, closing connection");
                    let _ = self.socket.close(None).await;
                    return Err(ClientError::Timeout(self.liveness));
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Envelope::parse(&text).map_err(|err| ClientError::Protocol {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::ConnectionClosed),
                Some(Ok(other)) => debug!(?other, "Skipping non-text frame"),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.socket.close(None).await?;
        Ok(())
    }
}

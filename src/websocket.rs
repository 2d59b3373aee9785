//! # WebSocket Session Channel
//!
//! Carries the session protocol over `GET /ws/session`. Each connection is an
//! independent actor owning one [`ChannelProtocol`].
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the channel starts uninitialized
//! 2. **Init**: the client sends `init`; the server answers with exactly one `welcome`
//! 3. **Messages**: each client `message` gets exactly one assistant `message`
//!    (or an `error` if the assistant fails), in the order they were sent
//! 4. **Close**: the session lease is released on every exit path
//!
//! ## Message Format:
//! JSON text frames with a `type` discriminator. Binary frames are rejected
//! with `unsupported_frame`; the channel stays open after any protocol error.
//!
//! ## Actor Model:
//! All channel state is mutated inside the actor's handlers. Assistant turns
//! run on a per-channel tokio task fed by an unbounded queue; it handles one
//! turn at a time and posts replies back to the actor as [`SendEnvelope`]
//! messages, so replies leave in the order their messages arrived.

use crate::session::{
    Assistant, ChannelProtocol, Envelope, Inbound, PendingTurn, ProtocolError, Role,
};
use crate::state::AppState;
use actix::prelude::*;
use actix::WeakAddr;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Envelope to be written to the client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendEnvelope(pub Envelope);

/// WebSocket actor for one session channel.
pub struct SessionWebSocket {
    protocol: ChannelProtocol,
    assistant: Arc<dyn Assistant>,
    app_state: web::Data<AppState>,
    /// Queue into the turn worker; `None` once the actor has stopped.
    turns: Option<mpsc::UnboundedSender<PendingTurn>>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl SessionWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let config = app_state.get_config();

        Self {
            protocol: ChannelProtocol::new(app_state.sessions.clone()),
            assistant: app_state.assistant.clone(),
            app_state,
            turns: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: config.sessions.heartbeat_interval(),
            client_timeout: config.sessions.client_timeout(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, envelope: &Envelope) {
        if matches!(envelope, Envelope::Error { .. }) {
            self.app_state.record_protocol_error();
        }

        match envelope.to_text() {
            Ok(text) => ctx.text(text),
            Err(err) => error!(kind = envelope.kind(), "Failed to encode envelope: {}", err),
        }
    }

    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, err: ProtocolError) {
        let envelope = self.protocol.reject(err);
        self.send(ctx, &envelope);
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match self.protocol.handle_text(text) {
            Inbound::Reply(envelope) => self.send(ctx, &envelope),
            Inbound::Turn(turn) => {
                let queued = self
                    .turns
                    .as_ref()
                    .is_some_and(|turns| turns.send(turn).is_ok());
                if !queued {
                    self.reject(ctx, ProtocolError::Internal("assistant worker unavailable".to_string()));
                }
            }
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    session_id = act.protocol.session_id().unwrap_or("-"),
                    "Session channel heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

/// Answer queued turns one at a time until the channel goes away.
async fn run_turns(
    mut turns: mpsc::UnboundedReceiver<PendingTurn>,
    assistant: Arc<dyn Assistant>,
    channel: WeakAddr<SessionWebSocket>,
) {
    while let Some(turn) = turns.recv().await {
        let session_id = turn.lease.session_id().to_string();
        let context = match turn.begin() {
            Ok(context) => context,
            Err(_) => {
                debug!(session_id = %session_id, "Skipping turn for released session");
                continue;
            }
        };

        let envelope = match assistant.reply(&context).await {
            Ok(reply) => match turn.lease.append(Role::Assistant, reply.as_str()) {
                Ok(_) => Envelope::assistant_reply(session_id, reply),
                Err(_) => {
                    debug!(session_id = %session_id, "Dropping reply for released session");
                    continue;
                }
            },
            Err(err) => {
                warn!(session_id = %session_id, code = "assistant_error", "Assistant failed: {}", err);
                Envelope::error(Some(session_id), &ProtocolError::Assistant(err.to_string()))
            }
        };

        match channel.upgrade() {
            Some(addr) => addr.do_send(SendEnvelope(envelope)),
            None => break,
        }
    }
}

impl Actor for SessionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.turns = Some(tx);
        tokio::spawn(run_turns(
            rx,
            self.assistant.clone(),
            ctx.address().downgrade(),
        ));

        self.heartbeat(ctx);
        self.app_state.channel_opened();
        info!("Session channel opened");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.turns = None;
        let session_id = self.protocol.session_id().map(str::to_owned);
        let released = self.protocol.close();
        self.app_state.channel_closed();

        info!(
            session_id = session_id.as_deref().unwrap_or("-"),
            released,
            "Session channel closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) | Ok(ws::Message::Continuation(_)) => {
                self.last_heartbeat = Instant::now();
                self.reject(ctx, ProtocolError::UnsupportedFrame);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Client closed session channel");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendEnvelope> for SessionWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendEnvelope, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// Upgrade `GET /ws/session` to a session channel.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = req.connection_info().peer_addr().unwrap_or("unknown"),
        "New session channel request"
    );

    ws::start(SessionWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, SessionClient};
    use crate::config::AppConfig;
    use crate::session::assistant::{AssistantError, AssistantTurn};
    use crate::session::{EchoAssistant, ReconnectPolicy};
    use actix_web::{App, HttpServer};
    use async_trait::async_trait;
    use serde_json::json;

    /// Holds back replies to messages starting with "slow".
    struct StaggeredAssistant;

    #[async_trait]
    impl Assistant for StaggeredAssistant {
        async fn reply(&self, turn: &AssistantTurn) -> Result<String, AssistantError> {
            if turn.message.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            Ok(format!("re: {}", turn.message))
        }
    }

    struct FailingAssistant;

    #[async_trait]
    impl Assistant for FailingAssistant {
        async fn reply(&self, _turn: &AssistantTurn) -> Result<String, AssistantError> {
            Err(AssistantError::Status(503))
        }
    }

    fn state_with(assistant: Arc<dyn Assistant>) -> AppState {
        let mut state = AppState::new(AppConfig::default()).unwrap();
        state.assistant = assistant;
        state
    }

    fn echo_state(configure: impl FnOnce(&mut AppConfig)) -> AppState {
        let mut config = AppConfig::default();
        configure(&mut config);
        config.validate().unwrap();

        let mut state = AppState::new(config).unwrap();
        state.assistant = Arc::new(EchoAssistant);
        state
    }

    async fn wait_for_release(state: &AppState) {
        for _ in 0..100 {
            if state.sessions.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session was not released");
    }

    async fn spawn_server(state: AppState) -> String {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws/session", web::get().to(session_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("ws://{}/ws/session", addr)
    }

    async fn connect(url: &str) -> SessionClient {
        SessionClient::connect(url, Duration::from_secs(5)).await.unwrap()
    }

    #[actix_web::test]
    async fn test_init_welcome_and_single_reply() {
        let state = state_with(Arc::new(EchoAssistant));
        let url = spawn_server(state.clone()).await;
        let mut client = connect(&url).await;

        let session_id = client
            .send_init(json!({"name": "Ada"}), Some("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(session_id, "s1");

        let reply = client.send_message("hello").await.unwrap();
        assert!(!reply.is_empty());

        let transcript = state.sessions.get("s1").unwrap().transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].role, Role::Assistant);
        client.close().await.unwrap();
    }

    #[actix_web::test]
    async fn test_replies_keep_send_order() {
        let url = spawn_server(state_with(Arc::new(StaggeredAssistant))).await;
        let mut client = connect(&url).await;
        let session_id = client.send_init(json!({}), None).await.unwrap();

        for content in ["slow first", "second", "third"] {
            client
                .send_envelope(&Envelope::user_message(session_id.clone(), content))
                .await
                .unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..3 {
            match client.recv_envelope().await.unwrap() {
                Envelope::Message { content, role, .. } => {
                    assert_eq!(role, Some(Role::Assistant));
                    replies.push(content);
                }
                other => panic!("unexpected envelope: {:?}", other),
            }
        }
        assert_eq!(replies, vec!["re: slow first", "re: second", "re: third"]);
    }

    #[actix_web::test]
    async fn test_violations_keep_channel_open() {
        let url = spawn_server(state_with(Arc::new(EchoAssistant))).await;
        let mut client = connect(&url).await;

        for (frame, code) in [
            (r#"{"type":"message","sessionId":"s1","content":"hi"}"#, "not_initialized"),
            (r#"{"type":"message","sessionId":"s1","content":"hi"}"#, "not_initialized"),
            ("not json", "invalid_json"),
            (r#"{"type":"teleport"}"#, "unknown_type"),
        ] {
            client.send_raw(frame).await.unwrap();
            match client.recv_envelope().await.unwrap() {
                Envelope::Error { code: got, .. } => assert_eq!(got, code),
                other => panic!("unexpected envelope: {:?}", other),
            }
        }

        assert_eq!(client.send_init(json!({}), Some("s1".to_string())).await.unwrap(), "s1");
        client
            .send_envelope(&Envelope::Init {
                session_id: None,
                metadata: json!({}),
            })
            .await
            .unwrap();
        match client.recv_envelope().await.unwrap() {
            Envelope::Error { code, .. } => assert_eq!(code, "duplicate_init"),
            other => panic!("unexpected envelope: {:?}", other),
        }
        assert!(!client.send_message("still here").await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_assistant_failure_is_reported_per_turn() {
        let url = spawn_server(state_with(Arc::new(FailingAssistant))).await;
        let mut client = connect(&url).await;
        client.send_init(json!({}), None).await.unwrap();

        match client.send_message("hello").await {
            Err(ClientError::Protocol { code, .. }) => assert_eq!(code, "assistant_error"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            client.send_message("again").await,
            Err(ClientError::Protocol { .. })
        ));
    }

    #[actix_web::test]
    async fn test_close_releases_session() {
        let state = state_with(Arc::new(EchoAssistant));
        let url = spawn_server(state.clone()).await;

        let mut client = connect(&url).await;
        client.send_init(json!({}), Some("s1".to_string())).await.unwrap();
        assert_eq!(state.sessions.active_count(), 1);
        client.close().await.unwrap();
        wait_for_release(&state).await;

        let mut again = connect(&url).await;
        assert_eq!(again.send_init(json!({}), Some("s1".to_string())).await.unwrap(), "s1");
    }

    #[actix_web::test]
    async fn test_resume_policy_reattaches_transcript_over_new_channel() {
        let state = echo_state(|config| config.sessions.reconnect_policy = ReconnectPolicy::Resume);
        let url = spawn_server(state.clone()).await;

        let mut client = connect(&url).await;
        client.send_init(json!({}), Some("s1".to_string())).await.unwrap();
        client.send_message("first visit").await.unwrap();
        client.close().await.unwrap();
        wait_for_release(&state).await;

        let mut again = connect(&url).await;
        again
            .send_envelope(&Envelope::Init {
                session_id: Some("s1".to_string()),
                metadata: json!({}),
            })
            .await
            .unwrap();
        match again.recv_envelope().await.unwrap() {
            Envelope::Welcome { session_id, resumed } => {
                assert_eq!(session_id, "s1");
                assert!(resumed);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        again
            .send_envelope(&Envelope::user_message("s1", "second visit"))
            .await
            .unwrap();
        assert!(matches!(
            again.recv_envelope().await.unwrap(),
            Envelope::Message { role: Some(Role::Assistant), .. }
        ));

        let contents: Vec<_> = state
            .sessions
            .get("s1")
            .unwrap()
            .transcript()
            .into_iter()
            .map(|entry| (entry.role, entry.content))
            .collect();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0], (Role::User, "first visit".to_string()));
        assert_eq!(contents[2], (Role::User, "second visit".to_string()));
    }

    #[actix_web::test]
    async fn test_session_limit_leaves_channel_usable() {
        let state = echo_state(|config| config.sessions.max_concurrent_sessions = 1);
        let url = spawn_server(state.clone()).await;

        let mut first = connect(&url).await;
        first.send_init(json!({}), Some("s1".to_string())).await.unwrap();

        let mut second = connect(&url).await;
        match second.send_init(json!({}), Some("s2".to_string())).await {
            Err(ClientError::Protocol { code, .. }) => assert_eq!(code, "session_limit"),
            other => panic!("unexpected result: {:?}", other),
        }

        first.close().await.unwrap();
        wait_for_release(&state).await;

        assert_eq!(second.send_init(json!({}), Some("s2".to_string())).await.unwrap(), "s2");
        assert!(!second.send_message("hello").await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_silent_client_is_disconnected_after_timeout() {
        let state = echo_state(|config| {
            config.sessions.heartbeat_interval_secs = 1;
            config.sessions.client_timeout_secs = 2;
        });
        let url = spawn_server(state.clone()).await;

        let mut client = connect(&url).await;
        client.send_init(json!({}), Some("s1".to_string())).await.unwrap();
        assert_eq!(state.get_metrics_snapshot().active_channels, 1);

        // The client does not read, so the server's pings go unanswered.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        wait_for_release(&state).await;
        assert_eq!(state.get_metrics_snapshot().active_channels, 0);

        assert!(client.recv_envelope().await.is_err());
    }
}

//! Per-connection session: `connecting -> validating -> active -> closed`.
//!
//! A session authenticates from the upgrade query, subscribes to its target
//! room plus the user's unmuted rooms, then pumps two sources until either
//! side goes away: hub frames from its outbox and client frames from the
//! socket. Writes are rate limited per user and go through the message
//! service, which persists and publishes them.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chatroom_core::InboundMessage;
use chatroom_storage::User;
use serde::Deserialize;
use thiserror::Error;
use tokio::{sync::OwnedSemaphorePermit, time::timeout};
use uuid::Uuid;

use crate::{
    access::AccessError,
    hub::{HubConnection, ServerFrame},
    messages::MessageError,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session_token: Option<String>,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Validating,
    Active,
    Closed,
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error("session_token is required")]
    MissingToken,
    #[error("Invalid or expired session")]
    InvalidSession,
    #[error("room_id must be a UUID")]
    InvalidRoom,
    #[error("{0}")]
    Access(&'static str),
    #[error("internal server error")]
    Storage(#[from] anyhow::Error),
}

impl From<AccessError> for ConnectError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound(message)
            | AccessError::Forbidden(message)
            | AccessError::InvalidInput(message)
            | AccessError::Conflict(message) => ConnectError::Access(message),
            AccessError::Storage(err) => ConnectError::Storage(err),
        }
    }
}

enum Flow {
    Continue,
    Close,
}

pub async fn websocket(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.connection_slots().try_acquire_owned() {
        Ok(permit) => ws.on_upgrade(move |socket| async move {
            let mut session = ConnectionSession::new(state, socket);
            session.run(params, permit).await;
        }),
        Err(_) => {
            state.record_messaging_rejection("connection_limit");
            (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response()
        }
    }
}

struct ConnectionSession {
    state: AppState,
    socket: WebSocket,
    phase: SessionPhase,
    send_timeout: Duration,
}

struct ActiveSession {
    user: User,
    room_id: Option<Uuid>,
    connection: HubConnection,
}

impl ConnectionSession {
    fn new(state: AppState, socket: WebSocket) -> Self {
        let send_timeout = Duration::from_secs(state.config().messaging.send_timeout_secs);
        Self {
            state,
            socket,
            phase: SessionPhase::Connecting,
            send_timeout,
        }
    }

    fn transition(&mut self, next: SessionPhase) {
        tracing::debug!(from = ?self.phase, to = ?next, "websocket session transition");
        self.phase = next;
    }

    async fn run(&mut self, params: ConnectParams, _permit: OwnedSemaphorePermit) {
        self.transition(SessionPhase::Validating);
        let (user, room_id) = match self.validate(params).await {
            Ok(validated) => validated,
            Err(err) => {
                match &err {
                    ConnectError::Storage(inner) => {
                        tracing::error!(err = ?inner, "websocket validation failed")
                    }
                    other => tracing::warn!(reason = %other, "websocket connection rejected"),
                }
                self.state.record_messaging_rejection("connect");
                self.send_error(&err.to_string()).await;
                self.close("connection rejected").await;
                self.transition(SessionPhase::Closed);
                return;
            }
        };

        let (connection, mut outbox) = self.state.hub().connect(user.id);
        let mut active = ActiveSession {
            user,
            room_id,
            connection,
        };
        self.subscribe(&mut active).await;
        self.transition(SessionPhase::Active);
        self.state.track_websocket(1);
        tracing::debug!(
            connection_id = %active.connection.id(),
            user_id = %active.user.id,
            room_id = ?active.room_id,
            rooms = active.connection.rooms().count(),
            "websocket session active"
        );

        loop {
            tokio::select! {
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    if !self.send_text(&frame).await {
                        break;
                    }
                }
                message = self.socket.recv() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Flow::Close = self.handle_inbound(&active, text.as_str()).await {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            self.send_error("binary frames are not supported").await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if self.socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(err)) => {
                            tracing::debug!(?err, "websocket receive failed");
                            break;
                        }
                    }
                }
            }
        }

        self.transition(SessionPhase::Closed);
        self.state.track_websocket(-1);
        if let Some(room_id) = active.room_id.filter(|_| !active.user.is_bot) {
            // Presence is not tracked; leaving is only traced.
            tracing::trace!(room_id = %room_id, user_id = %active.user.id, "presence leave");
        }
        tracing::debug!(
            connection_id = %active.connection.id(),
            user_id = %active.user.id,
            "websocket session closed"
        );
    }

    async fn validate(
        &mut self,
        params: ConnectParams,
    ) -> Result<(User, Option<Uuid>), ConnectError> {
        let token = params
            .session_token
            .filter(|token| !token.is_empty())
            .ok_or(ConnectError::MissingToken)?;
        let user = self
            .state
            .sessions()
            .authenticate(&token)
            .await?
            .ok_or(ConnectError::InvalidSession)?;

        let room_id = match params.room_id.filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(raw.parse::<Uuid>().map_err(|_| ConnectError::InvalidRoom)?),
            None => None,
        };
        if let Some(room_id) = room_id {
            let (room, _) = self.state.access().load(room_id, &user).await?;
            if user.is_bot && !room.bots_allowed {
                return Err(ConnectError::Access("Bots are not allowed in this chatroom"));
            }
        }
        Ok((user, room_id))
    }

    /// Target room first, then every unmuted room the user can still read.
    async fn subscribe(&mut self, active: &mut ActiveSession) {
        if let Some(room_id) = active.room_id {
            active.connection.subscribe(room_id);
        }
        let unmuted = match self.state.store().unmuted_rooms(active.user.id).await {
            Ok(rooms) => rooms,
            Err(err) => {
                tracing::warn!(?err, user_id = %active.user.id, "failed to load unmuted rooms");
                return;
            }
        };
        for room_id in unmuted {
            match self.state.access().can_access(room_id, &active.user).await {
                Ok(true) => active.connection.subscribe(room_id),
                Ok(false) => {}
                Err(err) => tracing::warn!(?err, room_id = %room_id, "access check failed"),
            }
        }
    }

    async fn handle_inbound(&mut self, active: &ActiveSession, raw: &str) -> Flow {
        let identity = format!("user:{}", active.user.id);
        match self.state.rate_limiter().check(&identity).await {
            Ok(decision) if decision.limited => {
                tracing::warn!(user_id = %active.user.id, "websocket client rate limited");
                self.state.record_messaging_rejection("rate_limited");
                self.send_error("Rate limit exceeded").await;
                self.close("rate limit exceeded").await;
                return Flow::Close;
            }
            Ok(_) => {}
            Err(err) => tracing::error!(?err, "rate limiter unavailable; allowing frame"),
        }

        let Some(room_id) = active.room_id else {
            self.send_error("Join a chatroom to send messages").await;
            return Flow::Continue;
        };

        let content = match InboundMessage::parse(raw)
            .and_then(|inbound| inbound.validate(self.state.messages().rules()))
        {
            Ok(content) => content,
            Err(err) => {
                self.state.record_messaging_rejection("invalid_frame");
                self.send_error(&err.to_string()).await;
                return Flow::Continue;
            }
        };

        let posted = match self
            .state
            .messages()
            .post(room_id, &active.user, content)
            .await
        {
            Ok(posted) => posted,
            Err(MessageError::Storage(err)) => {
                tracing::error!(?err, room_id = %room_id, "failed to persist message");
                self.send_error("internal server error").await;
                return Flow::Continue;
            }
            Err(err) => {
                self.state.record_messaging_rejection(err.code());
                self.send_error(&err.to_string()).await;
                return Flow::Continue;
            }
        };

        // The hub already queued a copy unless our outbox was full.
        if !posted.recipients.contains(&active.connection.id())
            && !self.send_text(&posted.frame).await
        {
            return Flow::Close;
        }
        Flow::Continue
    }

    async fn send_text(&mut self, payload: &Arc<str>) -> bool {
        let message = WsMessage::Text(String::from(payload.as_ref()).into());
        match timeout(self.send_timeout, self.socket.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(?err, "websocket send failed");
                false
            }
            Err(_) => {
                tracing::warn!("websocket send timeout");
                false
            }
        }
    }

    async fn send_error(&mut self, message: &str) {
        match (ServerFrame::Error { message }).encode() {
            Ok(frame) => {
                self.send_text(&frame).await;
            }
            Err(err) => tracing::error!(?err, "failed to encode error frame"),
        }
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: String::from(reason).into(),
        };
        let _ = timeout(
            self.send_timeout,
            self.socket.send(WsMessage::Close(Some(frame))),
        )
        .await;
    }
}

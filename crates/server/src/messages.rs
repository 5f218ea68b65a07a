//! Message lifecycle: create, edit, soft delete and listing, plus the REST
//! routes that expose them. Socket writes go through [`MessageService::post`]
//! as well, so both paths share validation, ordering and fan-out.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chatroom_core::{
    sanitize_markup, ContentRules, ContentType, InboundMessage, MessageContent, ValidationError,
    MAX_TEXT_LENGTH,
};
use chatroom_storage::{Chatroom, EditOutcome, Message, MessageQuery, NewMessage, User};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    access::{AccessError, AccessResolver},
    clock::Clock,
    error::ApiError,
    hub::{ConnectionId, RoomHub, ServerFrame},
    session::AuthUser,
    store::ChatStore,
    AppState,
};

pub const DEFAULT_PER_PAGE: i64 = 50;
pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message not found")]
    NotFound,
    #[error("You do not have access to this chatroom")]
    NoAccess,
    #[error("Only the creator can change this message")]
    NotCreator,
    #[error("The time window for changing this message has passed")]
    TooOld,
    #[error("Only text messages can be edited")]
    NotEditable,
    #[error("The new content is identical to the current content")]
    NoChange,
    #[error("The message was changed by another edit; reload and retry")]
    Stale,
    #[error("{0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl MessageError {
    pub fn code(&self) -> &'static str {
        match self {
            MessageError::NotFound => "not_found",
            MessageError::NoAccess => "no_access",
            MessageError::NotCreator => "not_creator",
            MessageError::TooOld => "too_old",
            MessageError::NotEditable => "not_editable",
            MessageError::NoChange => "no_change",
            MessageError::Stale => "stale",
            MessageError::Invalid(_) => "invalid",
            MessageError::Storage(_) => "storage",
        }
    }
}

impl From<AccessError> for MessageError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound(_) => MessageError::NotFound,
            AccessError::Forbidden(_) => MessageError::NoAccess,
            AccessError::InvalidInput(message) | AccessError::Conflict(message) => {
                MessageError::Invalid(message.to_string())
            }
            AccessError::Storage(err) => MessageError::Storage(err),
        }
    }
}

impl From<ValidationError> for MessageError {
    fn from(err: ValidationError) -> Self {
        MessageError::Invalid(err.to_string())
    }
}

/// A persisted message together with the frame that was fanned out.
#[derive(Debug)]
pub struct Posted {
    pub message: Message,
    pub frame: Arc<str>,
    pub recipients: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub chatroom_id: Option<Uuid>,
    pub content_type: Option<ContentType>,
    pub search: Option<String>,
    pub before: Option<Uuid>,
    pub include_deleted: bool,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
    access: AccessResolver,
    hub: RoomHub,
    clock: Arc<dyn Clock>,
    rules: ContentRules,
    edit_window: Duration,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        access: AccessResolver,
        hub: RoomHub,
        clock: Arc<dyn Clock>,
        rules: ContentRules,
        edit_window: Duration,
    ) -> Self {
        Self {
            store,
            access,
            hub,
            clock,
            rules,
            edit_window,
        }
    }

    pub fn rules(&self) -> &ContentRules {
        &self.rules
    }

    /// Persists a message after re-checking the author's access.
    pub async fn create(
        &self,
        chatroom_id: Uuid,
        author: &User,
        content: MessageContent,
    ) -> Result<Message, MessageError> {
        let (room, _) = self.access.load(chatroom_id, author).await?;
        if author.is_bot && !room.bots_allowed {
            return Err(MessageError::NoAccess);
        }
        self.persist(&room, Some(author.id), content).await
    }

    /// Creates and publishes under the room's writer lock, so subscribers
    /// observe messages in store order.
    pub async fn post(
        &self,
        chatroom_id: Uuid,
        author: &User,
        content: MessageContent,
    ) -> Result<Posted, MessageError> {
        let _writer = self.hub.lock_room(chatroom_id).await;
        let message = self.create(chatroom_id, author, content).await?;
        self.publish(message)
    }

    /// System generated `info` message without an author.
    pub async fn post_notice(
        &self,
        room: &Chatroom,
        text: impl Into<String>,
    ) -> Result<Posted, MessageError> {
        let _writer = self.hub.lock_room(room.id).await;
        let message = self
            .persist(room, None, MessageContent::info(text))
            .await?;
        self.publish(message)
    }

    fn publish(&self, message: Message) -> Result<Posted, MessageError> {
        let frame = ServerFrame::Message { data: &message }
            .encode()
            .map_err(anyhow::Error::from)?;
        let recipients = self.hub.publish(message.chatroom_id, frame.clone());
        tracing::debug!(
            message_id = %message.id,
            room_id = %message.chatroom_id,
            recipients = recipients.len(),
            "message published"
        );
        Ok(Posted {
            message,
            frame,
            recipients,
        })
    }

    async fn persist(
        &self,
        room: &Chatroom,
        user_id: Option<Uuid>,
        content: MessageContent,
    ) -> Result<Message, MessageError> {
        let body = if content.content_type.is_markup_sanitized() {
            let sanitized = sanitize_markup(&content.content);
            if sanitized.is_empty() {
                return Err(ValidationError::Empty.into());
            }
            sanitized
        } else {
            content.content
        };

        let message = self
            .store
            .insert_message(&NewMessage {
                id: Uuid::now_v7(),
                chatroom_id: room.id,
                user_id,
                content_type: content.content_type,
                content: body,
                content_meta: content.content_meta,
                created_at: self.clock.now(),
            })
            .await?;
        Ok(message)
    }

    /// Loads a live message and checks that `user` may still change it.
    async fn load_owned(&self, message_id: Uuid, user: &User) -> Result<Message, MessageError> {
        let Some(message) = self
            .store
            .find_message(message_id)
            .await?
            .filter(|message| !message.deleted)
        else {
            return Err(MessageError::NotFound);
        };
        self.access.resolve(message.chatroom_id, user).await?;
        if message.user_id != Some(user.id) {
            return Err(MessageError::NotCreator);
        }
        Ok(message)
    }

    fn within_window(&self, message: &Message) -> bool {
        self.clock.now() - message.created_at <= self.edit_window
    }

    /// Replaces the text of a message, keeping the old text in its history.
    /// An unchanged edit is reported as `NoChange` even outside the window.
    pub async fn update(
        &self,
        message_id: Uuid,
        user: &User,
        content: &str,
    ) -> Result<Message, MessageError> {
        let message = self.load_owned(message_id, user).await?;
        if !message.content_type.is_editable() {
            return Err(MessageError::NotEditable);
        }
        if content.chars().count() > MAX_TEXT_LENGTH {
            return Err(ValidationError::TextTooLong.into());
        }
        let sanitized = sanitize_markup(content);
        if sanitized == message.content {
            return Err(MessageError::NoChange);
        }
        if sanitized.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        if !self.within_window(&message) {
            return Err(MessageError::TooOld);
        }

        match self
            .store
            .record_edit(message.id, &message.content, &sanitized, self.clock.now())
            .await?
        {
            EditOutcome::Applied(edited) => Ok(edited),
            EditOutcome::Missing => Err(MessageError::NotFound),
            EditOutcome::Stale => Err(MessageError::Stale),
        }
    }

    pub async fn remove(&self, message_id: Uuid, user: &User) -> Result<(), MessageError> {
        let message = self.load_owned(message_id, user).await?;
        if !self.within_window(&message) {
            return Err(MessageError::TooOld);
        }
        if !self
            .store
            .soft_delete_message(message.id, self.clock.now())
            .await?
        {
            return Err(MessageError::NotFound);
        }
        Ok(())
    }

    /// Newest first. Listing across rooms and seeing deleted messages are
    /// reserved for admins.
    pub async fn list(&self, user: &User, filter: ListFilter) -> Result<MessagePage, MessageError> {
        match filter.chatroom_id {
            Some(chatroom_id) => {
                self.access.resolve(chatroom_id, user).await?;
            }
            None if !user.is_admin() => return Err(MessageError::NoAccess),
            None => {}
        }

        let page = filter.page.unwrap_or(1).max(1);
        let per_page = filter
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);

        let messages = self
            .store
            .list_messages(&MessageQuery {
                chatroom_id: filter.chatroom_id,
                content_type: filter.content_type,
                search: filter.search.filter(|search| !search.trim().is_empty()),
                before: filter.before,
                include_deleted: filter.include_deleted && user.is_admin(),
                limit: per_page,
                offset: (page - 1).saturating_mul(per_page),
            })
            .await?;

        Ok(MessagePage {
            messages,
            page,
            per_page,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PostTarget {
    chatroom_id: Uuid,
}

/// `POST /messages`, bots only. The body is parsed by hand so malformed
/// payloads get the usual `{ "message": ... }` error body.
pub async fn post_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    if !user.is_bot {
        return Err(ApiError::forbidden("Only bots can post messages over HTTP"));
    }
    let target: PostTarget = serde_json::from_slice(&body)
        .map_err(|err| ApiError::invalid(format!("malformed message: {err}")))?;
    let inbound: InboundMessage = serde_json::from_slice(&body)
        .map_err(|err| ApiError::invalid(format!("malformed message: {err}")))?;

    let messages = state.messages();
    let content = inbound.validate(messages.rules())?;
    let posted = messages.post(target.chatroom_id, &user, content).await?;
    Ok((StatusCode::CREATED, Json(posted.message)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    pub chatroom_id: Option<Uuid>,
    pub content_type: Option<ContentType>,
    pub search: Option<String>,
    pub before: Option<Uuid>,
    #[serde(default)]
    pub include_deleted: bool,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl From<ListMessagesQuery> for ListFilter {
    fn from(query: ListMessagesQuery) -> Self {
        Self {
            chatroom_id: query.chatroom_id,
            content_type: query.content_type,
            search: query.search,
            before: query.before,
            include_deleted: query.include_deleted,
            page: query.page,
            per_page: query.per_page,
        }
    }
}

pub async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    Ok(Json(state.messages().list(&user, query.into()).await?))
}

pub async fn list_room_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let filter = ListFilter {
        chatroom_id: Some(chatroom_id),
        ..query.into()
    };
    Ok(Json(state.messages().list(&user, filter).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

pub async fn update_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(message_id): Path<Uuid>,
    Json(body): Json<UpdateMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .messages()
        .update(message_id, &user, &body.content)
        .await
        .inspect_err(|err| {
            tracing::debug!(message_id = %message_id, code = err.code(), "edit rejected");
        })?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .messages()
        .remove(message_id, &user)
        .await
        .inspect_err(|err| {
            tracing::debug!(message_id = %message_id, code = err.code(), "delete rejected");
        })?;
    Ok(StatusCode::NO_CONTENT)
}

//! Persistence seam for the server. `PostgresChatStore` wraps the storage
//! crate repositories; `InMemoryChatStore` backs tests and database-less runs.

use anyhow::Result;
use async_trait::async_trait;
use chatroom_core::{ChatroomRole, SystemRole};
use chatroom_storage::{
    Chatroom, ChatroomMember, ChatroomUpdate, CreateUserError, EditOutcome, MemberMutation,
    Message, MessageQuery, NewChatroom, NewMessage, NewUser, PersistedSession, User,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryChatStore;
pub use postgres::PostgresChatStore;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_user(&self, user: &NewUser) -> Result<User, CreateUserError>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    /// `None` for unknown users, bots and wrong passwords alike.
    async fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<Uuid>>;
    async fn set_system_role(&self, user_id: Uuid, role: SystemRole) -> Result<bool>;
    async fn delete_user(&self, user_id: Uuid) -> Result<bool>;
    async fn store_bot_token(&self, user_id: Uuid, token_hash: &str) -> Result<()>;
    async fn find_bot_by_token(&self, token_hash: &str) -> Result<Option<User>>;

    async fn store_session(&self, session: &PersistedSession) -> Result<()>;
    async fn session_active(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn create_chatroom(&self, room: &NewChatroom, creator: Option<Uuid>)
        -> Result<Chatroom>;
    async fn find_chatroom(&self, chatroom_id: Uuid) -> Result<Option<Chatroom>>;
    async fn list_chatrooms(&self, user_id: Uuid, include_all: bool) -> Result<Vec<Chatroom>>;
    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        update: &ChatroomUpdate,
    ) -> Result<Option<Chatroom>>;
    async fn delete_chatroom(&self, chatroom_id: Uuid) -> Result<bool>;
    async fn set_join_token(&self, chatroom_id: Uuid, token: Uuid) -> Result<bool>;

    async fn find_member(&self, chatroom_id: Uuid, user_id: Uuid)
        -> Result<Option<ChatroomMember>>;
    async fn list_members(&self, chatroom_id: Uuid) -> Result<Vec<ChatroomMember>>;
    /// Returns `false` when a membership row already existed.
    async fn insert_member(&self, chatroom_id: Uuid, user_id: Uuid, role: ChatroomRole)
        -> Result<bool>;
    /// With `keep_manager`, the check for a remaining manager and the write
    /// happen atomically.
    async fn update_member_role(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
        keep_manager: bool,
    ) -> Result<MemberMutation>;
    async fn remove_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        keep_manager: bool,
    ) -> Result<MemberMutation>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message>;
    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>>;
    /// Compare-and-set: applies only while the message still holds `old_content`.
    async fn record_edit(
        &self,
        message_id: Uuid,
        old_content: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<EditOutcome>;
    async fn soft_delete_message(&self, message_id: Uuid, deleted_at: DateTime<Utc>)
        -> Result<bool>;
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>>;

    async fn set_favorite(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()>;
    async fn set_unmuted(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()>;
    async fn favorite_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn unmuted_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
}

use anyhow::Result;
use async_trait::async_trait;
use chatroom_core::{ChatroomRole, SystemRole};
use chatroom_storage::{
    Chatroom, ChatroomMember, ChatroomRepository, ChatroomUpdate, CreateUserError,
    CredentialError, EditOutcome, MemberMutation, Message, MessageQuery, MessageRepository, NewChatroom,
    NewMessage, NewUser, PersistedSession, PreferenceRepository, SessionPersistence, StoragePool,
    User, UserRepository,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ChatStore;

#[derive(Clone)]
pub struct PostgresChatStore {
    pool: StoragePool,
    chatrooms: ChatroomRepository,
    messages: MessageRepository,
    preferences: PreferenceRepository,
    sessions: SessionPersistence,
}

impl PostgresChatStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            chatrooms: ChatroomRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            preferences: PreferenceRepository::new(pool.clone()),
            sessions: SessionPersistence::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    async fn create_user(&self, user: &NewUser) -> Result<User, CreateUserError> {
        UserRepository::create_user(self.pool.pool(), user).await
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        UserRepository::find_by_id(self.pool.pool(), user_id).await
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        UserRepository::find_by_username(self.pool.pool(), username).await
    }

    async fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<Uuid>> {
        match UserRepository::verify_credentials(self.pool.pool(), username, password).await {
            Ok(user_id) => Ok(Some(user_id)),
            Err(err) => match err.downcast_ref::<CredentialError>() {
                Some(CredentialError::InvalidCredentials | CredentialError::UserNotFound) => {
                    Ok(None)
                }
                None => Err(err),
            },
        }
    }

    async fn set_system_role(&self, user_id: Uuid, role: SystemRole) -> Result<bool> {
        UserRepository::set_role(self.pool.pool(), user_id, role).await
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool> {
        UserRepository::delete_user(self.pool.pool(), user_id).await
    }

    async fn store_bot_token(&self, user_id: Uuid, token_hash: &str) -> Result<()> {
        UserRepository::store_bot_token(self.pool.pool(), user_id, token_hash).await
    }

    async fn find_bot_by_token(&self, token_hash: &str) -> Result<Option<User>> {
        UserRepository::find_by_bot_token(self.pool.pool(), token_hash).await
    }

    async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        self.sessions.store_session(session).await
    }

    async fn session_active(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.sessions.is_active(session_id, user_id, now).await
    }

    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.sessions.revoke(session_id, now).await
    }

    async fn create_chatroom(
        &self,
        room: &NewChatroom,
        creator: Option<Uuid>,
    ) -> Result<Chatroom> {
        self.chatrooms.create_chatroom(room, creator).await
    }

    async fn find_chatroom(&self, chatroom_id: Uuid) -> Result<Option<Chatroom>> {
        self.chatrooms.find_chatroom(chatroom_id).await
    }

    async fn list_chatrooms(&self, user_id: Uuid, include_all: bool) -> Result<Vec<Chatroom>> {
        self.chatrooms.list_visible(user_id, include_all).await
    }

    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        update: &ChatroomUpdate,
    ) -> Result<Option<Chatroom>> {
        self.chatrooms.update_chatroom(chatroom_id, update).await
    }

    async fn delete_chatroom(&self, chatroom_id: Uuid) -> Result<bool> {
        self.chatrooms.soft_delete(chatroom_id).await
    }

    async fn set_join_token(&self, chatroom_id: Uuid, token: Uuid) -> Result<bool> {
        self.chatrooms.set_join_token(chatroom_id, token).await
    }

    async fn find_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatroomMember>> {
        self.chatrooms.find_member(chatroom_id, user_id).await
    }

    async fn list_members(&self, chatroom_id: Uuid) -> Result<Vec<ChatroomMember>> {
        self.chatrooms.list_members(chatroom_id).await
    }

    async fn insert_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
    ) -> Result<bool> {
        self.chatrooms.insert_member(chatroom_id, user_id, role).await
    }

    async fn update_member_role(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        self.chatrooms
            .update_member_role(chatroom_id, user_id, role, keep_manager)
            .await
    }

    async fn remove_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        self.chatrooms
            .remove_member(chatroom_id, user_id, keep_manager)
            .await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        self.messages.insert(message).await
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.messages.find(message_id).await
    }

    async fn record_edit(
        &self,
        message_id: Uuid,
        old_content: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<EditOutcome> {
        self.messages
            .record_edit(message_id, old_content, new_content, edited_at)
            .await
    }

    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.messages.soft_delete(message_id, deleted_at).await
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        self.messages.list(query).await
    }

    async fn set_favorite(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        self.preferences.set_favorite(user_id, chatroom_id, on).await
    }

    async fn set_unmuted(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        self.preferences.set_unmuted(user_id, chatroom_id, on).await
    }

    async fn favorite_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.preferences.favorite_rooms(user_id).await
    }

    async fn unmuted_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.preferences.unmuted_rooms(user_id).await
    }
}

//! Per-request authorization for chatrooms.
//!
//! Nothing here is cached: membership, deletion and system roles can change
//! between two calls, so every read, write and subscription resolves again.

use std::sync::Arc;

use chatroom_core::ChatroomRole;
use chatroom_storage::{Chatroom, MemberMutation, User};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::store::ChatStore;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

const ROOM_NOT_FOUND: &str = "Chatroom not found";
const NO_ACCESS: &str = "You do not have access to this chatroom";
const NOT_MANAGER: &str = "You cannot manage this chatroom";
const BOTS_NOT_ALLOWED: &str = "Bots are not allowed in this chatroom";
const TOWNSQUARE_IMPLICIT: &str = "Townsquare membership is implicit";
const LAST_MANAGER: &str = "A chatroom must keep at least one manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomAccess {
    pub role: ChatroomRole,
    pub can_manage: bool,
}

#[derive(Clone)]
pub struct AccessResolver {
    store: Arc<dyn ChatStore>,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub async fn can_access(&self, chatroom_id: Uuid, user: &User) -> Result<bool, AccessError> {
        match self.resolve(chatroom_id, user).await {
            Ok(_) => Ok(true),
            Err(AccessError::NotFound(_) | AccessError::Forbidden(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn resolve(&self, chatroom_id: Uuid, user: &User) -> Result<RoomAccess, AccessError> {
        self.load(chatroom_id, user).await.map(|(_, access)| access)
    }

    /// The room together with the caller's access to it.
    pub async fn load(
        &self,
        chatroom_id: Uuid,
        user: &User,
    ) -> Result<(Chatroom, RoomAccess), AccessError> {
        let Some(room) = self.store.find_chatroom(chatroom_id).await? else {
            return Err(AccessError::NotFound(ROOM_NOT_FOUND));
        };

        if user.is_admin() {
            return Ok((
                room,
                RoomAccess {
                    role: ChatroomRole::Manage,
                    can_manage: true,
                },
            ));
        }
        if room.deleted {
            return Err(AccessError::NotFound(ROOM_NOT_FOUND));
        }

        let membership = self
            .store
            .find_member(chatroom_id, user.id)
            .await?
            .map(|member| member.role)
            .filter(|role| role.at_least(ChatroomRole::Member));

        let role = match (membership, room.is_townsquare) {
            (Some(role), _) => role,
            (None, true) => ChatroomRole::Member,
            (None, false) => return Err(AccessError::Forbidden(NO_ACCESS)),
        };

        Ok((
            room,
            RoomAccess {
                role,
                can_manage: role == ChatroomRole::Manage,
            },
        ))
    }

    async fn load_managed(
        &self,
        chatroom_id: Uuid,
        actor: &User,
    ) -> Result<Chatroom, AccessError> {
        let (room, access) = self.load(chatroom_id, actor).await?;
        if !access.can_manage {
            return Err(AccessError::Forbidden(NOT_MANAGER));
        }
        Ok(room)
    }

    async fn load_target(&self, room: &Chatroom, user_id: Uuid) -> Result<User, AccessError> {
        let Some(target) = self.store.find_user(user_id).await? else {
            return Err(AccessError::NotFound("User not found"));
        };
        if target.is_bot && !room.bots_allowed {
            return Err(AccessError::InvalidInput(BOTS_NOT_ALLOWED));
        }
        Ok(target)
    }

    /// Returns `false` when the user was already a member.
    pub async fn add_member(
        &self,
        chatroom_id: Uuid,
        actor: &User,
        user_id: Uuid,
        role: ChatroomRole,
    ) -> Result<bool, AccessError> {
        let room = self.load_managed(chatroom_id, actor).await?;
        if room.is_townsquare && role < ChatroomRole::Manage {
            return Err(AccessError::InvalidInput(TOWNSQUARE_IMPLICIT));
        }
        let target = self.load_target(&room, user_id).await?;
        Ok(self.store.insert_member(room.id, target.id, role).await?)
    }

    pub async fn update_member_role(
        &self,
        chatroom_id: Uuid,
        actor: &User,
        user_id: Uuid,
        role: ChatroomRole,
    ) -> Result<(), AccessError> {
        let room = self.load_managed(chatroom_id, actor).await?;

        if room.is_townsquare {
            // Only managers have rows in a townsquare.
            if role == ChatroomRole::Manage {
                let target = self.load_target(&room, user_id).await?;
                if !self.store.insert_member(room.id, target.id, role).await? {
                    self.store
                        .update_member_role(room.id, target.id, role, false)
                        .await?;
                }
            } else {
                self.store.remove_member(room.id, user_id, false).await?;
            }
            return Ok(());
        }

        match self
            .store
            .update_member_role(room.id, user_id, role, true)
            .await?
        {
            MemberMutation::Applied => Ok(()),
            MemberMutation::NotMember => Err(AccessError::NotFound("Member not found")),
            MemberMutation::LastManager => Err(AccessError::Conflict(LAST_MANAGER)),
        }
    }

    /// Managers remove anyone; everyone else may only remove themselves.
    pub async fn remove_member(
        &self,
        chatroom_id: Uuid,
        actor: &User,
        user_id: Uuid,
    ) -> Result<(), AccessError> {
        let (room, access) = self.load(chatroom_id, actor).await?;
        if room.is_townsquare {
            return Err(AccessError::InvalidInput(TOWNSQUARE_IMPLICIT));
        }
        if actor.id != user_id && !access.can_manage {
            return Err(AccessError::Forbidden(NOT_MANAGER));
        }

        match self.store.remove_member(room.id, user_id, true).await? {
            MemberMutation::Applied => Ok(()),
            MemberMutation::NotMember => Err(AccessError::NotFound("Member not found")),
            MemberMutation::LastManager => Err(AccessError::Conflict(LAST_MANAGER)),
        }
    }

    /// Idempotent: joining a room twice succeeds without a second row. The
    /// flag tells whether a membership was created.
    pub async fn join_by_token(
        &self,
        chatroom_id: Uuid,
        user: &User,
        token: Uuid,
    ) -> Result<(Chatroom, bool), AccessError> {
        let Some(room) = self
            .store
            .find_chatroom(chatroom_id)
            .await?
            .filter(|room| !room.deleted)
        else {
            return Err(AccessError::NotFound(ROOM_NOT_FOUND));
        };
        if room.is_townsquare {
            return Err(AccessError::InvalidInput("Townsquares cannot be joined"));
        }
        if room.join_token != token {
            return Err(AccessError::InvalidInput("Invalid join token"));
        }
        if user.is_bot && !room.bots_allowed {
            return Err(AccessError::InvalidInput(BOTS_NOT_ALLOWED));
        }
        let joined = self
            .store
            .insert_member(room.id, user.id, ChatroomRole::Member)
            .await?;
        Ok((room, joined))
    }

    /// Replaces the join token; the previous value stops working immediately.
    pub async fn reset_join_token(
        &self,
        chatroom_id: Uuid,
        actor: &User,
    ) -> Result<Uuid, AccessError> {
        let room = self.load_managed(chatroom_id, actor).await?;
        let token = Uuid::new_v4();
        if !self.store.set_join_token(room.id, token).await? {
            return Err(AccessError::NotFound(ROOM_NOT_FOUND));
        }
        Ok(token)
    }
}

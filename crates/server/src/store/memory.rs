use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chatroom_core::{ChatroomRole, ContentType, SystemRole};
use chatroom_storage::{
    verify_password, Chatroom, ChatroomMember, ChatroomUpdate, CreateUserError, EditOutcome,
    MemberMutation, Message, MessageEdit, MessageQuery, NewChatroom, NewMessage, NewUser,
    PersistedSession, User,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ChatStore;

/// Everything lives behind one lock so multi-table rules (cascades, the
/// last-manager check) are atomic.
#[derive(Default)]
pub struct InMemoryChatStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, StoredUser>,
    bot_tokens: HashMap<String, Uuid>,
    sessions: HashMap<Uuid, StoredSession>,
    chatrooms: HashMap<Uuid, Chatroom>,
    members: HashMap<(Uuid, Uuid), StoredMember>,
    messages: HashMap<Uuid, StoredMessage>,
    edits: HashMap<Uuid, Vec<MessageEdit>>,
    favorites: Vec<(Uuid, Uuid)>,
    unmutes: Vec<(Uuid, Uuid)>,
    sequence: i64,
}

struct StoredUser {
    user: User,
    password_hash: Option<String>,
}

struct StoredSession {
    session: PersistedSession,
    revoked_at: Option<DateTime<Utc>>,
}

struct StoredMember {
    role: ChatroomRole,
    joined_at: DateTime<Utc>,
}

struct StoredMessage {
    id: Uuid,
    sequence: i64,
    chatroom_id: Uuid,
    user_id: Option<Uuid>,
    content_type: ContentType,
    content: String,
    content_meta: Option<String>,
    deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn member_view(&self, chatroom_id: Uuid, user_id: Uuid) -> Option<ChatroomMember> {
        let member = self.members.get(&(chatroom_id, user_id))?;
        let user = &self.users.get(&user_id)?.user;
        Some(ChatroomMember {
            chatroom_id,
            user_id,
            username: user.username.clone(),
            is_bot: user.is_bot,
            role: member.role,
            joined_at: member.joined_at,
        })
    }

    fn manager_count(&self, chatroom_id: Uuid) -> usize {
        self.members
            .iter()
            .filter(|((room, _), member)| {
                *room == chatroom_id && member.role == ChatroomRole::Manage
            })
            .count()
    }

    fn hydrate(&self, row: &StoredMessage) -> Result<Message> {
        let chatroom = self
            .chatrooms
            .get(&row.chatroom_id)
            .ok_or_else(|| anyhow!("message {} references a missing chatroom", row.id))?;
        let author = row
            .user_id
            .and_then(|user_id| self.users.get(&user_id))
            .map(|stored| &stored.user);
        Ok(Message {
            id: row.id,
            sequence: row.sequence,
            chatroom_id: row.chatroom_id,
            chatroom_name: chatroom.name.clone(),
            user_id: row.user_id,
            username: author.map(|user| user.username.clone()),
            display_name: author.and_then(|user| user.display_name.clone()),
            user_bio: author.and_then(|user| user.bio.clone()),
            user_avatar: author.and_then(|user| user.avatar.clone()),
            content_type: row.content_type,
            content: row.content.clone(),
            content_meta: row.content_meta.clone(),
            deleted: row.deleted,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            edits: self.edits.get(&row.id).cloned().unwrap_or_default(),
        })
    }

    fn set_preference(
        list: &mut Vec<(Uuid, Uuid)>,
        user_id: Uuid,
        chatroom_id: Uuid,
        on: bool,
    ) {
        let key = (user_id, chatroom_id);
        if on {
            if !list.contains(&key) {
                list.push(key);
            }
        } else {
            list.retain(|entry| *entry != key);
        }
    }
}

fn sort_rooms(rooms: &mut [Chatroom]) {
    rooms.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then(a.created_at.cmp(&b.created_at))
    });
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_user(&self, user: &NewUser) -> Result<User, CreateUserError> {
        let mut state = self.state.write().await;
        if state
            .users
            .values()
            .any(|stored| stored.user.username == user.username)
        {
            return Err(CreateUserError::UsernameTaken);
        }
        let created = User {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            bio: None,
            avatar: None,
            role: user.role,
            is_bot: user.is_bot,
            owner_id: user.owner_id,
            created_at: Utc::now(),
        };
        state.users.insert(
            created.id,
            StoredUser {
                user: created.clone(),
                password_hash: user.password_hash.clone(),
            },
        );
        Ok(created)
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.get(&user_id).map(|stored| stored.user.clone()))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|stored| stored.user.username == username)
            .map(|stored| stored.user.clone()))
    }

    async fn verify_credentials(&self, username: &str, password: &str) -> Result<Option<Uuid>> {
        let state = self.state.read().await;
        let Some(stored) = state
            .users
            .values()
            .find(|stored| stored.user.username == username && !stored.user.is_bot)
        else {
            return Ok(None);
        };
        let Some(hash) = &stored.password_hash else {
            return Ok(None);
        };
        if verify_password(hash, password)? {
            Ok(Some(stored.user.id))
        } else {
            Ok(None)
        }
    }

    async fn set_system_role(&self, user_id: Uuid, role: SystemRole) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.users.get_mut(&user_id) {
            Some(stored) => {
                stored.user.role = role;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&user_id) {
            return Ok(false);
        }
        let mut removed: HashSet<Uuid> = state
            .users
            .values()
            .filter(|stored| stored.user.owner_id == Some(user_id))
            .map(|stored| stored.user.id)
            .collect();
        removed.insert(user_id);

        state.users.retain(|id, _| !removed.contains(id));
        state.bot_tokens.retain(|_, owner| !removed.contains(owner));
        state
            .sessions
            .retain(|_, stored| !removed.contains(&stored.session.user_id));
        state.members.retain(|(_, member), _| !removed.contains(member));
        state.favorites.retain(|(user, _)| !removed.contains(user));
        state.unmutes.retain(|(user, _)| !removed.contains(user));
        for message in state.messages.values_mut() {
            if message.user_id.is_some_and(|author| removed.contains(&author)) {
                message.user_id = None;
            }
        }
        Ok(true)
    }

    async fn store_bot_token(&self, user_id: Uuid, token_hash: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.bot_tokens.retain(|_, owner| *owner != user_id);
        state.bot_tokens.insert(token_hash.to_string(), user_id);
        Ok(())
    }

    async fn find_bot_by_token(&self, token_hash: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .bot_tokens
            .get(token_hash)
            .and_then(|user_id| state.users.get(user_id))
            .filter(|stored| stored.user.is_bot)
            .map(|stored| stored.user.clone()))
    }

    async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .sessions
            .entry(session.session_id)
            .or_insert_with(|| StoredSession {
                session: session.clone(),
                revoked_at: None,
            });
        Ok(())
    }

    async fn session_active(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.sessions.get(&session_id).is_some_and(|stored| {
            stored.session.user_id == user_id
                && stored.revoked_at.is_none()
                && stored.session.expires_at > now
        }))
    }

    async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session_id) {
            Some(stored) if stored.revoked_at.is_none() => {
                stored.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_chatroom(
        &self,
        room: &NewChatroom,
        creator: Option<Uuid>,
    ) -> Result<Chatroom> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let chatroom = Chatroom {
            id: room.id,
            name: room.name.clone(),
            description: room.description.clone(),
            image: room.image.clone(),
            unlisted: room.unlisted,
            pinned: false,
            deleted: false,
            is_townsquare: room.is_townsquare,
            bots_allowed: room.bots_allowed,
            join_token: room.join_token,
            created_at: now,
        };
        state.chatrooms.insert(chatroom.id, chatroom.clone());
        if let Some(creator) = creator {
            state.members.insert(
                (chatroom.id, creator),
                StoredMember {
                    role: ChatroomRole::Manage,
                    joined_at: now,
                },
            );
        }
        Ok(chatroom)
    }

    async fn find_chatroom(&self, chatroom_id: Uuid) -> Result<Option<Chatroom>> {
        let state = self.state.read().await;
        Ok(state.chatrooms.get(&chatroom_id).cloned())
    }

    async fn list_chatrooms(&self, user_id: Uuid, include_all: bool) -> Result<Vec<Chatroom>> {
        let state = self.state.read().await;
        let mut rooms: Vec<Chatroom> = state
            .chatrooms
            .values()
            .filter(|room| {
                include_all
                    || (!room.deleted
                        && ((room.is_townsquare && !room.unlisted)
                            || state.members.contains_key(&(room.id, user_id))))
            })
            .cloned()
            .collect();
        sort_rooms(&mut rooms);
        Ok(rooms)
    }

    async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        update: &ChatroomUpdate,
    ) -> Result<Option<Chatroom>> {
        let mut state = self.state.write().await;
        let Some(room) = state.chatrooms.get_mut(&chatroom_id) else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            room.name = name.clone();
        }
        if let Some(description) = &update.description {
            room.description = Some(description.clone());
        }
        if let Some(image) = &update.image {
            room.image = Some(image.clone());
        }
        if let Some(pinned) = update.pinned {
            room.pinned = pinned;
        }
        Ok(Some(room.clone()))
    }

    async fn delete_chatroom(&self, chatroom_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.chatrooms.get_mut(&chatroom_id) {
            Some(room) => {
                room.deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_join_token(&self, chatroom_id: Uuid, token: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.chatrooms.get_mut(&chatroom_id) {
            Some(room) => {
                room.join_token = token;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatroomMember>> {
        let state = self.state.read().await;
        Ok(state.member_view(chatroom_id, user_id))
    }

    async fn list_members(&self, chatroom_id: Uuid) -> Result<Vec<ChatroomMember>> {
        let state = self.state.read().await;
        let mut members: Vec<ChatroomMember> = state
            .members
            .keys()
            .filter(|(room, _)| *room == chatroom_id)
            .filter_map(|(room, user)| state.member_view(*room, *user))
            .collect();
        members.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.username.cmp(&b.username))
        });
        Ok(members)
    }

    async fn insert_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = (chatroom_id, user_id);
        if state.members.contains_key(&key) {
            return Ok(false);
        }
        state.members.insert(
            key,
            StoredMember {
                role,
                joined_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn update_member_role(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        let mut state = self.state.write().await;
        let Some(current) = state
            .members
            .get(&(chatroom_id, user_id))
            .map(|member| member.role)
        else {
            return Ok(MemberMutation::NotMember);
        };
        if keep_manager
            && current == ChatroomRole::Manage
            && role < ChatroomRole::Manage
            && state.manager_count(chatroom_id) <= 1
        {
            return Ok(MemberMutation::LastManager);
        }
        if let Some(member) = state.members.get_mut(&(chatroom_id, user_id)) {
            member.role = role;
        }
        Ok(MemberMutation::Applied)
    }

    async fn remove_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        let mut state = self.state.write().await;
        let Some(current) = state
            .members
            .get(&(chatroom_id, user_id))
            .map(|member| member.role)
        else {
            return Ok(MemberMutation::NotMember);
        };
        if keep_manager
            && current == ChatroomRole::Manage
            && state.manager_count(chatroom_id) <= 1
        {
            return Ok(MemberMutation::LastManager);
        }
        state.members.remove(&(chatroom_id, user_id));
        Ok(MemberMutation::Applied)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let mut state = self.state.write().await;
        if !state.chatrooms.contains_key(&message.chatroom_id) {
            return Err(anyhow!("chatroom {} does not exist", message.chatroom_id));
        }
        state.sequence += 1;
        let row = StoredMessage {
            id: message.id,
            sequence: state.sequence,
            chatroom_id: message.chatroom_id,
            user_id: message.user_id,
            content_type: message.content_type,
            content: message.content.clone(),
            content_meta: message.content_meta.clone(),
            deleted: false,
            deleted_at: None,
            created_at: message.created_at,
        };
        let hydrated = state.hydrate(&row)?;
        state.messages.insert(row.id, row);
        Ok(hydrated)
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        let state = self.state.read().await;
        state
            .messages
            .get(&message_id)
            .map(|row| state.hydrate(row))
            .transpose()
    }

    async fn record_edit(
        &self,
        message_id: Uuid,
        old_content: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<EditOutcome> {
        let mut state = self.state.write().await;
        let Some(row) = state.messages.get_mut(&message_id).filter(|row| !row.deleted) else {
            return Ok(EditOutcome::Missing);
        };
        if row.content != old_content {
            return Ok(EditOutcome::Stale);
        }
        row.content = new_content.to_string();
        state.edits.entry(message_id).or_default().push(MessageEdit {
            message_id,
            old_content: old_content.to_string(),
            edited_at,
        });
        let row = state
            .messages
            .get(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} vanished during edit"))?;
        state.hydrate(row).map(EditOutcome::Applied)
    }

    async fn soft_delete_message(
        &self,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&message_id) {
            Some(row) if !row.deleted => {
                row.deleted = true;
                row.deleted_at = Some(deleted_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let cutoff = match query.before {
            Some(before) => match state.messages.get(&before) {
                Some(reference) => Some(reference.created_at),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let needle = query
            .search
            .as_deref()
            .filter(|search| !search.is_empty())
            .map(str::to_lowercase);

        let mut rows: Vec<&StoredMessage> = state
            .messages
            .values()
            .filter(|row| query.chatroom_id.map_or(true, |id| row.chatroom_id == id))
            .filter(|row| query.content_type.map_or(true, |ty| row.content_type == ty))
            .filter(|row| query.include_deleted || !row.deleted)
            .filter(|row| cutoff.map_or(true, |cutoff| row.created_at < cutoff))
            .filter(|row| match &needle {
                Some(needle) => {
                    matches!(row.content_type, ContentType::Text | ContentType::Info)
                        && row.content.to_lowercase().contains(needle.as_str())
                }
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });

        rows.into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .map(|row| state.hydrate(row))
            .collect()
    }

    async fn set_favorite(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        let mut state = self.state.write().await;
        MemoryState::set_preference(&mut state.favorites, user_id, chatroom_id, on);
        Ok(())
    }

    async fn set_unmuted(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        let mut state = self.state.write().await;
        MemoryState::set_preference(&mut state.unmutes, user_id, chatroom_id, on);
        Ok(())
    }

    async fn favorite_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .favorites
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, room)| *room)
            .collect())
    }

    async fn unmuted_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .unmutes
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, room)| *room)
            .collect())
    }
}

//! Chatroom REST routes: room CRUD, membership, join tokens and per-user
//! notification preferences. Authorization is delegated to the resolver.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chatroom_core::{sanitize_markup, ChatroomRole};
use chatroom_storage::{Chatroom, ChatroomMember, ChatroomUpdate, NewChatroom, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{access::RoomAccess, error::ApiError, session::AuthUser, AppState};

const NAME_MAX: usize = 100;
const DESCRIPTION_MAX: usize = 1_000;

#[derive(Debug, Serialize)]
pub struct ChatroomView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub unlisted: bool,
    pub pinned: bool,
    pub deleted: bool,
    pub is_townsquare: bool,
    pub bots_allowed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatroomRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_manage: Option<bool>,
    /// Only present for callers that manage the room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_token: Option<Uuid>,
    pub favorite: bool,
    pub unmuted: bool,
}

impl ChatroomView {
    fn new(room: Chatroom, access: Option<RoomAccess>) -> Self {
        let join_token = access
            .filter(|access| access.can_manage)
            .map(|_| room.join_token);
        Self {
            id: room.id,
            name: room.name,
            description: room.description,
            image: room.image,
            unlisted: room.unlisted,
            pinned: room.pinned,
            deleted: room.deleted,
            is_townsquare: room.is_townsquare,
            bots_allowed: room.bots_allowed,
            created_at: room.created_at,
            role: access.map(|access| access.role),
            can_manage: access.map(|access| access.can_manage),
            join_token,
            favorite: false,
            unmuted: false,
        }
    }
}

pub(crate) fn clean_name(raw: &str) -> Result<String, ApiError> {
    let name = sanitize_markup(raw);
    if name.is_empty() {
        return Err(ApiError::invalid("name must be provided"));
    }
    if name.chars().count() > NAME_MAX {
        return Err(ApiError::invalid(format!(
            "name must be at most {NAME_MAX} characters"
        )));
    }
    Ok(name)
}

pub(crate) fn clean_description(raw: Option<String>) -> Result<Option<String>, ApiError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let description = sanitize_markup(&raw);
    if description.chars().count() > DESCRIPTION_MAX {
        return Err(ApiError::invalid(format!(
            "description must be at most {DESCRIPTION_MAX} characters"
        )));
    }
    Ok(Some(description))
}

#[derive(Debug, Deserialize)]
pub struct CreateChatroomRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub unlisted: bool,
    #[serde(default = "default_bots_allowed")]
    pub bots_allowed: bool,
    #[serde(default)]
    pub is_townsquare: bool,
}

fn default_bots_allowed() -> bool {
    true
}

pub async fn create_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CreateChatroomRequest>,
) -> Result<(StatusCode, Json<ChatroomView>), ApiError> {
    if user.is_bot {
        return Err(ApiError::forbidden("Bots cannot create chatrooms"));
    }
    if payload.is_townsquare && !user.is_admin() {
        return Err(ApiError::forbidden("Only admins can create townsquares"));
    }

    let room = state
        .store()
        .create_chatroom(
            &NewChatroom {
                id: Uuid::new_v4(),
                name: clean_name(&payload.name)?,
                description: clean_description(payload.description)?,
                image: payload.image,
                unlisted: payload.unlisted,
                is_townsquare: payload.is_townsquare,
                bots_allowed: payload.bots_allowed,
                join_token: Uuid::new_v4(),
            },
            Some(user.id),
        )
        .await?;
    info!(
        room_id = %room.id,
        user_id = %user.id,
        townsquare = room.is_townsquare,
        "chatroom created"
    );

    let access = state.access().resolve(room.id, &user).await?;
    Ok((
        StatusCode::CREATED,
        Json(ChatroomView::new(room, Some(access))),
    ))
}

pub async fn list_chatrooms(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ChatroomView>>, ApiError> {
    let store = state.store();
    let rooms = store.list_chatrooms(user.id, user.is_admin()).await?;
    let favorites = store.favorite_rooms(user.id).await?;
    let unmuted = store.unmuted_rooms(user.id).await?;

    Ok(Json(
        rooms
            .into_iter()
            .map(|room| {
                let id = room.id;
                let mut view = ChatroomView::new(room, None);
                view.favorite = favorites.contains(&id);
                view.unmuted = unmuted.contains(&id);
                view
            })
            .collect(),
    ))
}

async fn view_for(
    state: &AppState,
    user: &User,
    chatroom_id: Uuid,
) -> Result<ChatroomView, ApiError> {
    let (room, access) = state.access().load(chatroom_id, user).await?;
    let store = state.store();
    let favorite = store.favorite_rooms(user.id).await?.contains(&room.id);
    let unmuted = store.unmuted_rooms(user.id).await?.contains(&room.id);
    let mut view = ChatroomView::new(room, Some(access));
    view.favorite = favorite;
    view.unmuted = unmuted;
    Ok(view)
}

pub async fn get_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<Json<ChatroomView>, ApiError> {
    Ok(Json(view_for(&state, &user, chatroom_id).await?))
}

/// `is_townsquare`, `unlisted` and `bots_allowed` are fixed at creation and
/// deliberately absent here.
#[derive(Debug, Deserialize)]
pub struct UpdateChatroomRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

pub async fn update_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
    Json(payload): Json<UpdateChatroomRequest>,
) -> Result<Json<ChatroomView>, ApiError> {
    let access = state.access().resolve(chatroom_id, &user).await?;
    if !access.can_manage {
        return Err(ApiError::forbidden("You cannot manage this chatroom"));
    }
    if payload.pinned.is_some() && !user.is_admin() {
        return Err(ApiError::forbidden("Only admins can pin chatrooms"));
    }

    let update = ChatroomUpdate {
        name: payload.name.as_deref().map(clean_name).transpose()?,
        description: clean_description(payload.description)?,
        image: payload.image,
        pinned: payload.pinned,
    };
    if state
        .store()
        .update_chatroom(chatroom_id, &update)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found("Chatroom not found"));
    }
    Ok(Json(view_for(&state, &user, chatroom_id).await?))
}

pub async fn delete_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let access = state.access().resolve(chatroom_id, &user).await?;
    if !access.can_manage {
        return Err(ApiError::forbidden("You cannot manage this chatroom"));
    }
    state.store().delete_chatroom(chatroom_id).await?;
    state.hub().close_room(chatroom_id);
    info!(room_id = %chatroom_id, user_id = %user.id, "chatroom deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<Json<Vec<ChatroomMember>>, ApiError> {
    state.access().resolve(chatroom_id, &user).await?;
    Ok(Json(state.store().list_members(chatroom_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    #[serde(default = "default_member_role")]
    pub role: ChatroomRole,
}

fn default_member_role() -> ChatroomRole {
    ChatroomRole::Member
}

pub async fn add_member(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
    Json(payload): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    let added = state
        .access()
        .add_member(chatroom_id, &user, payload.user_id, payload.role)
        .await?;
    Ok(if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: ChatroomRole,
}

pub async fn update_member(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((chatroom_id, member_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateMemberRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .access()
        .update_member_role(chatroom_id, &user, member_id, payload.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((chatroom_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .access()
        .remove_member(chatroom_id, &user, member_id)
        .await?;
    revoke_live_access(&state, chatroom_id, member_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Admins keep reading a room after losing their membership; everyone else
/// stops receiving its live frames immediately.
async fn revoke_live_access(
    state: &AppState,
    chatroom_id: Uuid,
    member_id: Uuid,
) -> Result<(), ApiError> {
    let still_allowed = match state.store().find_user(member_id).await? {
        Some(member) => state.access().can_access(chatroom_id, &member).await?,
        None => false,
    };
    if !still_allowed {
        let evicted = state.hub().evict_user(chatroom_id, member_id);
        tracing::debug!(
            room_id = %chatroom_id,
            user_id = %member_id,
            evicted,
            "live access revoked"
        );
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub token: Uuid,
}

pub async fn join_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<ChatroomView>, ApiError> {
    let (room, joined) = state
        .access()
        .join_by_token(chatroom_id, &user, payload.token)
        .await?;
    if joined && !user.is_bot {
        let notice = format!("{} joined the chatroom", user.username);
        if let Err(err) = state.messages().post_notice(&room, notice).await {
            tracing::warn!(?err, room_id = %room.id, "failed to post join notice");
        }
    }
    Ok(Json(view_for(&state, &user, chatroom_id).await?))
}

#[derive(Debug, Serialize)]
pub struct JoinTokenResponse {
    pub join_token: Uuid,
}

pub async fn reset_join_token(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<Json<JoinTokenResponse>, ApiError> {
    let join_token = state.access().reset_join_token(chatroom_id, &user).await?;
    Ok(Json(JoinTokenResponse { join_token }))
}

pub async fn favorite(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.access().resolve(chatroom_id, &user).await?;
    state.store().set_favorite(user.id, chatroom_id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unfavorite(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store().set_favorite(user.id, chatroom_id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unmuted rooms are subscribed for live notifications on every connect.
pub async fn unmute(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.access().resolve(chatroom_id, &user).await?;
    state.store().set_unmuted(user.id, chatroom_id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mute(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store().set_unmuted(user.id, chatroom_id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::tests::{admin, human},
        clock::SystemClock,
        config::ServerConfig,
        messages::ListFilter,
        session::SessionSigner,
        store::InMemoryChatStore,
        StorageState,
    };
    use chatroom_core::ContentType;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = ServerConfig::default();
        let signer = SessionSigner::from_config(&config.session).expect("signer");
        AppState::new(
            Arc::new(config),
            StorageState::unconfigured(),
            Arc::new(InMemoryChatStore::new()),
            Arc::new(SystemClock),
            signer,
        )
    }

    fn create_request(name: &str, is_townsquare: bool) -> CreateChatroomRequest {
        CreateChatroomRequest {
            name: name.to_string(),
            description: Some("<i>plans</i>".to_string()),
            image: None,
            unlisted: false,
            bots_allowed: true,
            is_townsquare,
        }
    }

    #[test]
    fn join_token_is_only_shown_to_managers() {
        let room = Chatroom {
            id: Uuid::new_v4(),
            name: "ops".into(),
            description: None,
            image: None,
            unlisted: false,
            pinned: false,
            deleted: false,
            is_townsquare: false,
            bots_allowed: true,
            join_token: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let member = ChatroomView::new(
            room.clone(),
            Some(RoomAccess {
                role: ChatroomRole::Member,
                can_manage: false,
            }),
        );
        assert!(member.join_token.is_none());

        let manager = ChatroomView::new(
            room.clone(),
            Some(RoomAccess {
                role: ChatroomRole::Manage,
                can_manage: true,
            }),
        );
        assert_eq!(manager.join_token, Some(room.join_token));

        let json = serde_json::to_value(ChatroomView::new(room, None)).unwrap();
        assert!(json.get("join_token").is_none());
        assert!(json.get("role").is_none());
    }

    #[test]
    fn names_are_sanitized_and_bounded() {
        assert_eq!(clean_name("<b>ops</b> team").unwrap(), "ops team");
        assert!(clean_name("<i></i>").is_err());
        assert!(clean_name(&"x".repeat(NAME_MAX + 1)).is_err());
        assert!(clean_description(Some("y".repeat(DESCRIPTION_MAX + 1))).is_err());
        assert_eq!(clean_description(None).unwrap(), None);
    }

    #[tokio::test]
    async fn creator_manages_and_joiners_get_a_single_notice() {
        let state = state();
        let alice = human(state.store(), "alice").await;
        let bob = human(state.store(), "bob").await;

        let (status, Json(created)) = create_chatroom(
            State(state.clone()),
            AuthUser(alice.clone()),
            Json(create_request("ops", false)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.role, Some(ChatroomRole::Manage));
        assert_eq!(created.description.as_deref(), Some("plans"));
        let token = created.join_token.expect("manager sees the token");

        let wrong = join_chatroom(
            State(state.clone()),
            AuthUser(bob.clone()),
            Path(created.id),
            Json(JoinRequest {
                token: Uuid::new_v4(),
            }),
        )
        .await;
        assert!(matches!(wrong, Err(ApiError::InvalidInput(_))));

        for _ in 0..2 {
            let Json(joined) = join_chatroom(
                State(state.clone()),
                AuthUser(bob.clone()),
                Path(created.id),
                Json(JoinRequest { token }),
            )
            .await
            .unwrap();
            assert_eq!(joined.role, Some(ChatroomRole::Member));
            assert!(joined.join_token.is_none());
        }

        let page = state
            .messages()
            .list(
                &alice,
                ListFilter {
                    chatroom_id: Some(created.id),
                    ..ListFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content_type, ContentType::Info);
        assert_eq!(page.messages[0].content, "bob joined the chatroom");
        assert_eq!(page.messages[0].user_id, None);
    }

    #[tokio::test]
    async fn townsquares_and_pins_are_reserved_for_admins() {
        let state = state();
        let alice = human(state.store(), "alice").await;
        let root = admin(state.store(), "root").await;

        let refused = create_chatroom(
            State(state.clone()),
            AuthUser(alice.clone()),
            Json(create_request("square", true)),
        )
        .await;
        assert!(matches!(refused, Err(ApiError::Forbidden(_))));

        let (_, Json(square)) = create_chatroom(
            State(state.clone()),
            AuthUser(root.clone()),
            Json(create_request("square", true)),
        )
        .await
        .unwrap();
        assert!(square.is_townsquare);

        let (_, Json(own)) = create_chatroom(
            State(state.clone()),
            AuthUser(alice.clone()),
            Json(create_request("mine", false)),
        )
        .await
        .unwrap();
        let pin = |pinned| UpdateChatroomRequest {
            name: None,
            description: None,
            image: None,
            pinned: Some(pinned),
        };
        let refused = update_chatroom(
            State(state.clone()),
            AuthUser(alice.clone()),
            Path(own.id),
            Json(pin(true)),
        )
        .await;
        assert!(matches!(refused, Err(ApiError::Forbidden(_))));

        let Json(pinned) = update_chatroom(
            State(state.clone()),
            AuthUser(root.clone()),
            Path(own.id),
            Json(pin(true)),
        )
        .await
        .unwrap();
        assert!(pinned.pinned);
    }

    #[tokio::test]
    async fn preferences_show_up_in_listings() {
        let state = state();
        let root = admin(state.store(), "root").await;
        let alice = human(state.store(), "alice").await;
        let (_, Json(square)) = create_chatroom(
            State(state.clone()),
            AuthUser(root),
            Json(create_request("square", true)),
        )
        .await
        .unwrap();

        favorite(State(state.clone()), AuthUser(alice.clone()), Path(square.id))
            .await
            .unwrap();
        unmute(State(state.clone()), AuthUser(alice.clone()), Path(square.id))
            .await
            .unwrap();

        let Json(rooms) = list_chatrooms(State(state.clone()), AuthUser(alice.clone()))
            .await
            .unwrap();
        let listed = rooms.iter().find(|room| room.id == square.id).unwrap();
        assert!(listed.favorite);
        assert!(listed.unmuted);

        mute(State(state.clone()), AuthUser(alice.clone()), Path(square.id))
            .await
            .unwrap();
        let Json(view) = get_chatroom(State(state), AuthUser(alice), Path(square.id))
            .await
            .unwrap();
        assert!(view.favorite);
        assert!(!view.unmuted);
    }

    #[tokio::test]
    async fn removed_members_stop_receiving_live_frames() {
        let state = state();
        let alice = human(state.store(), "alice").await;
        let bob = human(state.store(), "bob").await;
        let (_, Json(created)) = create_chatroom(
            State(state.clone()),
            AuthUser(alice.clone()),
            Json(create_request("ops", false)),
        )
        .await
        .unwrap();
        join_chatroom(
            State(state.clone()),
            AuthUser(bob.clone()),
            Path(created.id),
            Json(JoinRequest {
                token: created.join_token.unwrap(),
            }),
        )
        .await
        .unwrap();

        let (mut watcher, _watcher_outbox) = state.hub().connect(alice.id);
        let (mut removed, mut removed_outbox) = state.hub().connect(bob.id);
        watcher.subscribe(created.id);
        removed.subscribe(created.id);
        assert_eq!(state.hub().subscriber_count(created.id), 2);

        remove_member(
            State(state.clone()),
            AuthUser(alice.clone()),
            Path((created.id, bob.id)),
        )
        .await
        .unwrap();
        assert_eq!(state.hub().subscriber_count(created.id), 1);
        let delivered = state.hub().publish(created.id, Arc::from("after removal"));
        assert_eq!(delivered, vec![watcher.id()]);
        assert!(removed_outbox.try_recv().is_err());

        delete_chatroom(State(state.clone()), AuthUser(alice), Path(created.id))
            .await
            .unwrap();
        assert_eq!(state.hub().subscriber_count(created.id), 0);
    }
}

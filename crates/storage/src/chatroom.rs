use anyhow::Result;
use chatroom_core::ChatroomRole;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::StoragePool;

#[derive(Clone)]
pub struct ChatroomRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct Chatroom {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub unlisted: bool,
    pub pinned: bool,
    pub deleted: bool,
    pub is_townsquare: bool,
    pub bots_allowed: bool,
    pub join_token: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct ChatroomMember {
    pub chatroom_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub is_bot: bool,
    #[sqlx(try_from = "String")]
    pub role: ChatroomRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChatroom {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub unlisted: bool,
    pub is_townsquare: bool,
    pub bots_allowed: bool,
    pub join_token: Uuid,
}

/// Mutable room attributes. `unlisted`, `is_townsquare` and `bots_allowed`
/// are fixed at creation and intentionally absent here.
#[derive(Debug, Clone, Default)]
pub struct ChatroomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub pinned: Option<bool>,
}

/// Outcome of a guarded membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberMutation {
    Applied,
    NotMember,
    LastManager,
}

const CHATROOM_COLUMNS: &str = "id, name, description, image, unlisted, pinned, deleted, \
     is_townsquare, bots_allowed, join_token, created_at";

const MEMBER_SELECT: &str = r#"
    SELECT m.chatroom_id, m.user_id, u.username, u.is_bot, m.role, m.joined_at
    FROM chatroom_members m
    JOIN users u ON u.id = m.user_id
"#;

impl ChatroomRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Inserts the room and, when a creator is given, their `manage` membership
    /// in one transaction.
    pub async fn create_chatroom(
        &self,
        room: &NewChatroom,
        creator: Option<Uuid>,
    ) -> Result<Chatroom> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            r#"
            INSERT INTO chatrooms (id, name, description, image, unlisted, is_townsquare,
                                   bots_allowed, join_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {CHATROOM_COLUMNS}
            "#
        );
        let chatroom = sqlx::query_as::<_, Chatroom>(&query)
            .bind(room.id)
            .bind(&room.name)
            .bind(room.description.as_deref())
            .bind(room.image.as_deref())
            .bind(room.unlisted)
            .bind(room.is_townsquare)
            .bind(room.bots_allowed)
            .bind(room.join_token)
            .fetch_one(&mut *tx)
            .await?;

        if let Some(creator) = creator {
            sqlx::query(
                r#"
                INSERT INTO chatroom_members (chatroom_id, user_id, role)
                VALUES ($1, $2, 'manage')
                "#,
            )
            .bind(chatroom.id)
            .bind(creator)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chatroom)
    }

    pub async fn find_chatroom(&self, chatroom_id: Uuid) -> Result<Option<Chatroom>> {
        let query = format!("SELECT {CHATROOM_COLUMNS} FROM chatrooms WHERE id = $1");
        let chatroom = sqlx::query_as::<_, Chatroom>(&query)
            .bind(chatroom_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(chatroom)
    }

    /// Listed townsquares plus the rooms `user_id` belongs to. `include_all`
    /// returns every room, deleted ones included.
    pub async fn list_visible(&self, user_id: Uuid, include_all: bool) -> Result<Vec<Chatroom>> {
        let query = format!(
            r#"
            SELECT {CHATROOM_COLUMNS}
            FROM chatrooms c
            WHERE $2
               OR (NOT c.deleted AND (
                    (c.is_townsquare AND NOT c.unlisted)
                    OR EXISTS (
                        SELECT 1 FROM chatroom_members m
                        WHERE m.chatroom_id = c.id AND m.user_id = $1
                    )
               ))
            ORDER BY c.pinned DESC, c.created_at ASC
            "#
        );
        let rooms = sqlx::query_as::<_, Chatroom>(&query)
            .bind(user_id)
            .bind(include_all)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rooms)
    }

    pub async fn update_chatroom(
        &self,
        chatroom_id: Uuid,
        update: &ChatroomUpdate,
    ) -> Result<Option<Chatroom>> {
        let query = format!(
            r#"
            UPDATE chatrooms
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                image = COALESCE($4, image),
                pinned = COALESCE($5, pinned)
            WHERE id = $1
            RETURNING {CHATROOM_COLUMNS}
            "#
        );
        let chatroom = sqlx::query_as::<_, Chatroom>(&query)
            .bind(chatroom_id)
            .bind(update.name.as_deref())
            .bind(update.description.as_deref())
            .bind(update.image.as_deref())
            .bind(update.pinned)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(chatroom)
    }

    pub async fn soft_delete(&self, chatroom_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE chatrooms SET deleted = TRUE WHERE id = $1")
            .bind(chatroom_id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_join_token(&self, chatroom_id: Uuid, token: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE chatrooms SET join_token = $2 WHERE id = $1")
            .bind(chatroom_id)
            .bind(token)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChatroomMember>> {
        let query = format!("{MEMBER_SELECT} WHERE m.chatroom_id = $1 AND m.user_id = $2");
        let member = sqlx::query_as::<_, ChatroomMember>(&query)
            .bind(chatroom_id)
            .bind(user_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(member)
    }

    pub async fn list_members(&self, chatroom_id: Uuid) -> Result<Vec<ChatroomMember>> {
        let query =
            format!("{MEMBER_SELECT} WHERE m.chatroom_id = $1 ORDER BY m.joined_at ASC, u.username");
        let members = sqlx::query_as::<_, ChatroomMember>(&query)
            .bind(chatroom_id)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(members)
    }

    /// Returns `false` when the user already had a membership row.
    pub async fn insert_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO chatroom_members (chatroom_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (chatroom_id, user_id) DO NOTHING
            "#,
        )
        .bind(chatroom_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Changes a member's role. With `keep_manager` set, demoting the only
    /// `manage` member is refused.
    pub async fn update_member_role(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        role: ChatroomRole,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = lock_member(&mut tx, chatroom_id, user_id).await? else {
            return Ok(MemberMutation::NotMember);
        };

        if keep_manager
            && current == ChatroomRole::Manage
            && role < ChatroomRole::Manage
            && lock_manager_count(&mut tx, chatroom_id).await? <= 1
        {
            return Ok(MemberMutation::LastManager);
        }

        sqlx::query(
            "UPDATE chatroom_members SET role = $3 WHERE chatroom_id = $1 AND user_id = $2",
        )
        .bind(chatroom_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(MemberMutation::Applied)
    }

    /// Deletes a membership row. With `keep_manager` set, removing the only
    /// `manage` member is refused.
    pub async fn remove_member(
        &self,
        chatroom_id: Uuid,
        user_id: Uuid,
        keep_manager: bool,
    ) -> Result<MemberMutation> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = lock_member(&mut tx, chatroom_id, user_id).await? else {
            return Ok(MemberMutation::NotMember);
        };

        if keep_manager
            && current == ChatroomRole::Manage
            && lock_manager_count(&mut tx, chatroom_id).await? <= 1
        {
            return Ok(MemberMutation::LastManager);
        }

        sqlx::query("DELETE FROM chatroom_members WHERE chatroom_id = $1 AND user_id = $2")
            .bind(chatroom_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(MemberMutation::Applied)
    }
}

async fn lock_member(
    tx: &mut Transaction<'_, Postgres>,
    chatroom_id: Uuid,
    user_id: Uuid,
) -> Result<Option<ChatroomRole>> {
    let role = sqlx::query_scalar::<_, String>(
        r#"
        SELECT role FROM chatroom_members
        WHERE chatroom_id = $1 AND user_id = $2
        FOR UPDATE
        "#,
    )
    .bind(chatroom_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    role.map(|raw| raw.parse::<ChatroomRole>().map_err(anyhow::Error::from))
        .transpose()
}

// Locks every manager row so concurrent demotions serialize on the count.
async fn lock_manager_count(tx: &mut Transaction<'_, Postgres>, chatroom_id: Uuid) -> Result<usize> {
    let managers = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT user_id FROM chatroom_members
        WHERE chatroom_id = $1 AND role = 'manage'
        FOR UPDATE
        "#,
    )
    .bind(chatroom_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(managers.len())
}

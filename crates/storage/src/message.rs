use std::collections::HashMap;

use anyhow::Result;
use chatroom_core::ContentType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{escape_like, StoragePool};

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

/// A message joined with its author and room so it can be sent to clients as-is.
#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    #[serde(skip)]
    pub sequence: i64,
    pub chatroom_id: Uuid,
    pub chatroom_name: String,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub user_bio: Option<String>,
    pub user_avatar: Option<String>,
    #[sqlx(try_from = "String")]
    pub content_type: ContentType,
    pub content: String,
    pub content_meta: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub edits: Vec<MessageEdit>,
}

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct MessageEdit {
    #[serde(skip)]
    pub message_id: Uuid,
    pub old_content: String,
    pub edited_at: DateTime<Utc>,
}

/// Outcome of a guarded edit.
#[derive(Debug, Clone)]
pub enum EditOutcome {
    Applied(Message),
    /// No live message with that id.
    Missing,
    /// The stored content no longer matches the expected previous content.
    Stale,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub chatroom_id: Uuid,
    pub user_id: Option<Uuid>,
    pub content_type: ContentType,
    pub content: String,
    pub content_meta: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Listing filters. `before` selects messages strictly older than the
/// referenced message; an unknown reference yields nothing.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub chatroom_id: Option<Uuid>,
    pub content_type: Option<ContentType>,
    pub search: Option<String>,
    pub before: Option<Uuid>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

const MESSAGE_SELECT: &str = r#"
    SELECT m.id, m.sequence, m.chatroom_id, c.name AS chatroom_name, m.user_id,
           u.username, u.display_name, u.bio AS user_bio, u.avatar AS user_avatar,
           m.content_type, m.content, m.content_meta, m.deleted, m.deleted_at, m.created_at
    FROM messages m
    JOIN chatrooms c ON c.id = m.chatroom_id
    LEFT JOIN users u ON u.id = m.user_id
"#;

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, message: &NewMessage) -> Result<Message> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chatroom_id, user_id, content_type, content, content_meta,
                                  created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(message.chatroom_id)
        .bind(message.user_id)
        .bind(message.content_type.as_str())
        .bind(&message.content)
        .bind(message.content_meta.as_deref())
        .bind(message.created_at)
        .execute(self.pool.pool())
        .await?;

        self.find(message.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("message {} vanished after insert", message.id))
    }

    pub async fn find(&self, message_id: Uuid) -> Result<Option<Message>> {
        let query = format!("{MESSAGE_SELECT} WHERE m.id = $1");
        let Some(mut message) = sqlx::query_as::<_, Message>(&query)
            .bind(message_id)
            .fetch_optional(self.pool.pool())
            .await?
        else {
            return Ok(None);
        };
        message.edits = self.edits_for(&[message.id]).await?.remove(&message.id).unwrap_or_default();
        Ok(Some(message))
    }

    /// Overwrites the row only while it still holds `old_content`, and appends
    /// `old_content` to the history in the same transaction.
    pub async fn record_edit(
        &self,
        message_id: Uuid,
        old_content: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<EditOutcome> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE messages SET content = $3 WHERE id = $1 AND content = $2 AND NOT deleted",
        )
        .bind(message_id)
        .bind(old_content)
        .bind(new_content)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            let live: Option<(bool,)> =
                sqlx::query_as("SELECT deleted FROM messages WHERE id = $1")
                    .bind(message_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match live {
                Some((false,)) => EditOutcome::Stale,
                _ => EditOutcome::Missing,
            });
        }
        sqlx::query(
            "INSERT INTO message_edits (message_id, old_content, edited_at) VALUES ($1, $2, $3)",
        )
        .bind(message_id)
        .bind(old_content)
        .bind(edited_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(match self.find(message_id).await? {
            Some(message) => EditOutcome::Applied(message),
            None => EditOutcome::Missing,
        })
    }

    pub async fn soft_delete(&self, message_id: Uuid, deleted_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET deleted = TRUE, deleted_at = $2 WHERE id = $1 AND NOT deleted",
        )
        .bind(message_id)
        .bind(deleted_at)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Newest first, ties broken by insertion order.
    pub async fn list(&self, filter: &MessageQuery) -> Result<Vec<Message>> {
        let mut builder = QueryBuilder::<Postgres>::new(MESSAGE_SELECT);
        builder.push(" WHERE TRUE");

        if let Some(chatroom_id) = filter.chatroom_id {
            builder.push(" AND m.chatroom_id = ").push_bind(chatroom_id);
        }
        if let Some(content_type) = filter.content_type {
            builder
                .push(" AND m.content_type = ")
                .push_bind(content_type.as_str());
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{}%", escape_like(search));
            builder
                .push(" AND m.content_type IN ('text', 'info') AND m.content ILIKE ")
                .push_bind(pattern);
        }
        if let Some(before) = filter.before {
            builder
                .push(" AND m.created_at < (SELECT created_at FROM messages WHERE id = ")
                .push_bind(before)
                .push(")");
        }
        if !filter.include_deleted {
            builder.push(" AND NOT m.deleted");
        }

        builder
            .push(" ORDER BY m.created_at DESC, m.sequence DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let mut messages = builder
            .build_query_as::<Message>()
            .fetch_all(self.pool.pool())
            .await?;

        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let mut edits = self.edits_for(&ids).await?;
        for message in &mut messages {
            message.edits = edits.remove(&message.id).unwrap_or_default();
        }
        Ok(messages)
    }

    async fn edits_for(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<MessageEdit>>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, MessageEdit>(
            r#"
            SELECT message_id, old_content, edited_at
            FROM message_edits
            WHERE message_id = ANY($1)
            ORDER BY edited_at ASC, id ASC
            "#,
        )
        .bind(message_ids)
        .fetch_all(self.pool.pool())
        .await?;

        let mut grouped: HashMap<Uuid, Vec<MessageEdit>> = HashMap::new();
        for edit in rows {
            grouped.entry(edit.message_id).or_default().push(edit);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use crate::{ChatroomRepository, NewChatroom};

    #[tokio::test]
    async fn edits_and_soft_deletes_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("message repository test").await? else {
            return Ok(());
        };
        let rooms = ChatroomRepository::new(pool.clone());
        let messages = MessageRepository::new(pool.clone());

        let room = rooms
            .create_chatroom(
                &NewChatroom {
                    id: Uuid::new_v4(),
                    name: "history".into(),
                    description: None,
                    image: None,
                    unlisted: true,
                    is_townsquare: true,
                    bots_allowed: true,
                    join_token: Uuid::new_v4(),
                },
                None,
            )
            .await?;

        let now = Utc::now();
        let first = messages
            .insert(&NewMessage {
                id: Uuid::now_v7(),
                chatroom_id: room.id,
                user_id: None,
                content_type: ContentType::Text,
                content: "one".into(),
                content_meta: None,
                created_at: now,
            })
            .await?;
        let second = messages
            .insert(&NewMessage {
                id: Uuid::now_v7(),
                chatroom_id: room.id,
                user_id: None,
                content_type: ContentType::Text,
                content: "two".into(),
                content_meta: None,
                created_at: now + chrono::Duration::milliseconds(5),
            })
            .await?;
        assert_eq!(first.chatroom_name, "history");

        let EditOutcome::Applied(edited) = messages.record_edit(first.id, "one", "uno", now).await?
        else {
            panic!("first edit should apply");
        };
        assert_eq!(edited.content, "uno");
        assert_eq!(edited.edits.len(), 1);
        assert_eq!(edited.edits[0].old_content, "one");

        // A writer that read "one" before the edit above must not clobber it.
        assert!(matches!(
            messages.record_edit(first.id, "one", "ein", now).await?,
            EditOutcome::Stale
        ));
        assert!(matches!(
            messages.record_edit(Uuid::new_v4(), "one", "ein", now).await?,
            EditOutcome::Missing
        ));
        let reloaded = messages.find(first.id).await?.expect("message exists");
        assert_eq!(reloaded.content, "uno");
        assert_eq!(reloaded.edits.len(), 1);

        let page = messages
            .list(&MessageQuery {
                chatroom_id: Some(room.id),
                limit: 10,
                ..Default::default()
            })
            .await?;
        assert_eq!(
            page.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let older = messages
            .list(&MessageQuery {
                chatroom_id: Some(room.id),
                before: Some(second.id),
                limit: 10,
                ..Default::default()
            })
            .await?;
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, first.id);

        assert!(messages.soft_delete(second.id, Utc::now()).await?);
        let visible = messages
            .list(&MessageQuery {
                chatroom_id: Some(room.id),
                limit: 10,
                ..Default::default()
            })
            .await?;
        assert_eq!(visible.len(), 1);

        sqlx::query("DELETE FROM chatrooms WHERE id = $1")
            .bind(room.id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}

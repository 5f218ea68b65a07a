use anyhow::Result;
use uuid::Uuid;

use crate::StoragePool;

/// Per-user favorite and unmute flags, one row per (user, chatroom).
#[derive(Clone)]
pub struct PreferenceRepository {
    pool: StoragePool,
}

#[derive(Clone, Copy)]
enum PreferenceTable {
    Favorites,
    Unmutes,
}

impl PreferenceTable {
    fn name(self) -> &'static str {
        match self {
            PreferenceTable::Favorites => "chatroom_favorites",
            PreferenceTable::Unmutes => "chatroom_unmutes",
        }
    }
}

impl PreferenceRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn set_favorite(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        self.set(PreferenceTable::Favorites, user_id, chatroom_id, on)
            .await
    }

    pub async fn set_unmuted(&self, user_id: Uuid, chatroom_id: Uuid, on: bool) -> Result<()> {
        self.set(PreferenceTable::Unmutes, user_id, chatroom_id, on)
            .await
    }

    pub async fn favorite_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.rooms(PreferenceTable::Favorites, user_id).await
    }

    pub async fn unmuted_rooms(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.rooms(PreferenceTable::Unmutes, user_id).await
    }

    async fn set(
        &self,
        table: PreferenceTable,
        user_id: Uuid,
        chatroom_id: Uuid,
        on: bool,
    ) -> Result<()> {
        let query = if on {
            format!(
                "INSERT INTO {} (user_id, chatroom_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                table.name()
            )
        } else {
            format!(
                "DELETE FROM {} WHERE user_id = $1 AND chatroom_id = $2",
                table.name()
            )
        };
        sqlx::query(&query)
            .bind(user_id)
            .bind(chatroom_id)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    async fn rooms(&self, table: PreferenceTable, user_id: Uuid) -> Result<Vec<Uuid>> {
        let query = format!(
            "SELECT chatroom_id FROM {} WHERE user_id = $1 ORDER BY created_at",
            table.name()
        );
        let rooms = sqlx::query_scalar::<_, Uuid>(&query)
            .bind(user_id)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rooms)
    }
}

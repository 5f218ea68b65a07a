use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::StoragePool;
use anyhow::Result;

#[derive(Clone)]
pub struct SessionPersistence {
    pool: StoragePool,
}

#[derive(Debug, Clone)]
pub struct PersistedSession {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionPersistence {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn store_session(&self, session: &PersistedSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, issued_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(session.issued_at)
        .bind(session.expires_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// True while the session row exists, belongs to `user_id`, is unrevoked
    /// and unexpired at `now`.
    pub async fn is_active(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sessions
                WHERE session_id = $1 AND user_id = $2
                  AND revoked_at IS NULL AND expires_at > $3
            )
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(active)
    }

    pub async fn revoke(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = $2 WHERE session_id = $1 AND revoked_at IS NULL",
        )
        .bind(session_id)
        .bind(now)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use crate::{hash_password, NewUser, UserRepository};
    use chrono::Duration;

    #[tokio::test]
    async fn revoked_sessions_are_inactive_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("session persistence test").await? else {
            return Ok(());
        };
        let persistence = SessionPersistence::new(pool.clone());

        let username = format!("s{}", &Uuid::new_v4().simple().to_string()[..12]);
        let user = UserRepository::create_user(
            pool.pool(),
            &NewUser::human(username, hash_password("supersecret")?),
        )
        .await?;

        let now = Utc::now();
        let session = PersistedSession {
            session_id: Uuid::new_v4(),
            user_id: user.id,
            issued_at: now,
            expires_at: now + Duration::hours(1),
        };
        persistence.store_session(&session).await?;

        assert!(persistence.is_active(session.session_id, user.id, now).await?);
        assert!(
            !persistence
                .is_active(session.session_id, user.id, now + Duration::hours(2))
                .await?
        );
        assert!(persistence.revoke(session.session_id, now).await?);
        assert!(!persistence.is_active(session.session_id, user.id, now).await?);

        UserRepository::delete_user(pool.pool(), user.id).await?;
        Ok(())
    }
}

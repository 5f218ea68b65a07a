use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chatroom_core::SystemRole;
use chrono::{DateTime, Utc};
use pwhash::rand_core::OsRng;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

/// Repository utilities for user persistence.
pub struct UserRepository;

#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: SystemRole,
    pub is_bot: bool,
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub role: SystemRole,
    pub is_bot: bool,
    pub owner_id: Option<Uuid>,
}

impl NewUser {
    pub fn human(username: impl Into<String>, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            display_name: None,
            password_hash: Some(password_hash),
            role: SystemRole::User,
            is_bot: false,
            owner_id: None,
        }
    }

    pub fn bot(username: impl Into<String>, display_name: Option<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            display_name,
            password_hash: None,
            role: SystemRole::User,
            is_bot: true,
            owner_id: Some(owner_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

const USER_COLUMNS: &str =
    "id, username, display_name, bio, avatar, role, is_bot, owner_id, created_at";

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("hashing password failed: {err}"))?
        .to_string();
    Ok(hash)
}

/// Returns `Ok(false)` for a wrong password and `Err` only for a corrupt hash.
pub fn verify_password(password_hash: &str, password: &str) -> Result<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|err| anyhow!("invalid password hash: {err}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

impl UserRepository {
    pub async fn create_user(pool: &PgPool, user: &NewUser) -> Result<User, CreateUserError> {
        let query = format!(
            r#"
            INSERT INTO users (id, username, display_name, password_hash, role, is_bot, owner_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&query)
            .bind(user.id)
            .bind(&user.username)
            .bind(user.display_name.as_deref())
            .bind(user.password_hash.as_deref())
            .bind(user.role.as_str())
            .bind(user.is_bot)
            .bind(user.owner_id)
            .fetch_one(pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db_err) if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") => {
                    CreateUserError::UsernameTaken
                }
                other => CreateUserError::Other(
                    anyhow!(other).context(format!("creating user '{}'", user.username)),
                ),
            })
    }

    pub async fn find_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&query)
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        let user = sqlx::query_as::<_, User>(&query)
            .bind(username)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("querying user '{username}'"))?;
        Ok(user)
    }

    /// Verify credentials and return the user id when successful.
    pub async fn verify_credentials(pool: &PgPool, username: &str, password: &str) -> Result<Uuid> {
        let record = sqlx::query_as::<_, (Uuid, Option<String>)>(
            r#"
            SELECT id, password_hash
            FROM users
            WHERE username = $1 AND NOT is_bot
            "#,
        )
        .bind(username)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user '{username}'"))?;

        let Some((user_id, Some(password_hash))) = record else {
            return Err(CredentialError::UserNotFound.into());
        };

        if !verify_password(&password_hash, password)
            .with_context(|| format!("checking password for '{username}'"))?
        {
            return Err(CredentialError::InvalidCredentials.into());
        }

        Ok(user_id)
    }

    pub async fn set_role(pool: &PgPool, user_id: Uuid, role: SystemRole) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET role = $2 WHERE id = $1")
            .bind(user_id)
            .bind(role.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Authored messages keep existing with a null creator; owned bots go too.
    pub async fn delete_user(pool: &PgPool, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn store_bot_token(pool: &PgPool, user_id: Uuid, token_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_tokens (user_id, token_hash)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET token_hash = EXCLUDED.token_hash,
                created_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(token_hash)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_bot_token(pool: &PgPool, token_hash: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.username, u.display_name, u.bio, u.avatar, u.role, u.is_bot,
                   u.owner_id, u.created_at
            FROM bot_tokens t
            JOIN users u ON u.id = t.user_id
            WHERE t.token_hash = $1 AND u.is_bot
            "#,
        )
        .bind(token_hash)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password(&hash, "correct horse").unwrap());
        assert!(!verify_password(&hash, "battery staple").unwrap());
        assert!(verify_password("not-a-hash", "x").is_err());
    }

    #[tokio::test]
    async fn duplicate_usernames_are_rejected_when_database_available() -> anyhow::Result<()> {
        let Some(pool) = test_pool("user repository test").await? else {
            return Ok(());
        };

        let username = format!("u{}", &Uuid::new_v4().simple().to_string()[..12]);
        let user = NewUser::human(username.clone(), hash_password("supersecret")?);
        let created = UserRepository::create_user(pool.pool(), &user).await?;
        assert_eq!(created.username, username);

        let again = NewUser::human(username.clone(), hash_password("supersecret")?);
        let err = UserRepository::create_user(pool.pool(), &again)
            .await
            .unwrap_err();
        assert!(matches!(err, CreateUserError::UsernameTaken));

        let verified =
            UserRepository::verify_credentials(pool.pool(), &username, "supersecret").await?;
        assert_eq!(verified, created.id);

        assert!(UserRepository::delete_user(pool.pool(), created.id).await?);
        Ok(())
    }
}

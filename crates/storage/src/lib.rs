//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::Result;
use sqlx::{migrate::Migrator, postgres::PgPoolOptions};

pub mod chatroom;
pub mod message;
pub mod preference;
pub mod session;
pub mod user;

pub use sqlx::PgPool;

pub use chatroom::{
    Chatroom, ChatroomMember, ChatroomRepository, ChatroomUpdate, MemberMutation, NewChatroom,
};
pub use message::{EditOutcome, Message, MessageEdit, MessageQuery, MessageRepository, NewMessage};
pub use preference::PreferenceRepository;
pub use session::{PersistedSession, SessionPersistence};
pub use user::{
    hash_password, verify_password, CreateUserError, CredentialError, NewUser, User,
    UserRepository,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Apply pending migrations from `migrations/`.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    MIGRATOR.run(pool.pool()).await?;
    Ok(())
}

/// Escape `%`, `_` and `\` so user input matches literally inside `LIKE`.
pub(crate) fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

use axum::{extract::State, http::StatusCode, Json};
use chatroom_storage::{hash_password, CreateUserError, NewUser, User};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{error::ApiError, session::AuthUser, AppState};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
struct ValidatedRegister {
    username: String,
    password: String,
}

impl RegisterRequest {
    fn validate(self) -> Result<ValidatedRegister, ApiError> {
        let username = validate_username(&self.username)?;
        if self.password.trim().chars().count() < PASSWORD_MIN {
            return Err(ApiError::invalid(format!(
                "password must be at least {PASSWORD_MIN} characters long"
            )));
        }
        Ok(ValidatedRegister {
            username,
            password: self.password,
        })
    }
}

/// Lowercases and checks a username: 3-32 characters of `[a-z0-9_]`.
pub(crate) fn validate_username(raw: &str) -> Result<String, ApiError> {
    let username = raw.trim().to_lowercase();
    let length = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&length) {
        return Err(ApiError::invalid(format!(
            "username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ApiError::invalid(
            "username may only contain letters, digits and underscores",
        ));
    }
    Ok(username)
}

fn map_create_error(err: CreateUserError) -> ApiError {
    match err {
        CreateUserError::UsernameTaken => ApiError::Conflict("username already taken".into()),
        CreateUserError::Other(err) => ApiError::Internal(err),
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub username: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let request = payload.validate()?;
    let password = request.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(anyhow::Error::from)??;

    let user = state
        .store()
        .create_user(&NewUser::human(request.username, password_hash))
        .await
        .map_err(map_create_error)?;
    info!(user_id = %user.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
        }),
    ))
}

pub async fn me(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

/// Authored messages survive with a null creator; owned bots go with the owner.
pub async fn delete_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<StatusCode, ApiError> {
    if !state.store().delete_user(user.id).await? {
        return Err(ApiError::not_found("User not found"));
    }
    info!(user_id = %user.id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBotResponse {
    pub bot: User,
    /// Shown once; only its hash is stored.
    pub token: String,
}

pub async fn create_bot(
    State(state): State<AppState>,
    AuthUser(owner): AuthUser,
    Json(payload): Json<CreateBotRequest>,
) -> Result<(StatusCode, Json<CreateBotResponse>), ApiError> {
    if owner.is_bot {
        return Err(ApiError::forbidden("Bots cannot create bots"));
    }
    let username = validate_username(&payload.username)?;
    let display_name = payload
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    let bot = state
        .store()
        .create_user(&NewUser::bot(username, display_name, owner.id))
        .await
        .map_err(map_create_error)?;
    let token = state.sessions().issue_bot_token(bot.id).await?;
    info!(bot_id = %bot.id, owner_id = %owner.id, "bot created");

    Ok((StatusCode::CREATED, Json(CreateBotResponse { bot, token })))
}

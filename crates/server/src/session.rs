use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chatroom_crypto::{
    generate_secret, generate_signing_key, hash_secret, sign_message, verify_signature,
    verifying_key_from, Signature, SigningKey, VerifyingKey,
};
use chatroom_storage::{PersistedSession, User};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{clock::Clock, config::SessionConfig, error::ApiError, store::ChatStore, AppState};

pub const BOT_TOKEN_PREFIX: &str = "bot_";

#[derive(Clone)]
pub struct SessionService {
    signer: SessionSigner,
    store: Arc<dyn ChatStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(
        signer: SessionSigner,
        store: Arc<dyn ChatStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            signer,
            store,
            clock,
            ttl,
        }
    }

    pub async fn login(&self, attempt: LoginAttempt) -> Result<Option<LoginResponse>> {
        let Some(user_id) = self
            .store
            .verify_credentials(&attempt.username, &attempt.password)
            .await?
        else {
            return Ok(None);
        };
        self.issue(user_id).await.map(Some)
    }

    /// Creates and persists a session for `user_id`.
    pub async fn issue(&self, user_id: Uuid) -> Result<LoginResponse> {
        let issued_at = self.clock.now();
        let claims = SessionClaims {
            session_id: Uuid::new_v4(),
            user_id,
            issued_at,
            expires_at: issued_at + self.ttl,
        };
        let token = self.signer.sign(&claims)?;
        self.store
            .store_session(&PersistedSession {
                session_id: claims.session_id,
                user_id,
                issued_at,
                expires_at: claims.expires_at,
            })
            .await?;

        Ok(LoginResponse {
            token,
            expires_at: claims.expires_at,
        })
    }

    /// Resolves a session or bot token to its user. Expired, revoked and
    /// forged tokens, as well as tokens of deleted users, yield `None`.
    pub async fn authenticate(&self, token: &str) -> Result<Option<User>> {
        if token.starts_with(BOT_TOKEN_PREFIX) {
            return self.store.find_bot_by_token(&hash_secret(token)).await;
        }

        let Some(claims) = self.signer.verify(token) else {
            return Ok(None);
        };
        let now = self.clock.now();
        if claims.expires_at <= now {
            return Ok(None);
        }
        if !self
            .store
            .session_active(claims.session_id, claims.user_id, now)
            .await?
        {
            return Ok(None);
        }
        self.store.find_user(claims.user_id).await
    }

    /// Revokes the session behind `token`; bot tokens are not sessions.
    pub async fn logout(&self, token: &str) -> Result<bool> {
        match self.signer.verify(token) {
            Some(claims) => {
                self.store
                    .revoke_session(claims.session_id, self.clock.now())
                    .await
            }
            None => Ok(false),
        }
    }

    /// Returns the raw token; only its hash is kept.
    pub async fn issue_bot_token(&self, bot_id: Uuid) -> Result<String> {
        let token = format!("{BOT_TOKEN_PREFIX}{}", generate_secret());
        self.store
            .store_bot_token(bot_id, &hash_secret(&token))
            .await?;
        Ok(token)
    }
}

#[derive(Clone)]
pub struct SessionSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SessionSigner {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let signing_key = match config.signing_key.as_deref() {
            Some(raw) => {
                let decoded = URL_SAFE_NO_PAD.decode(raw.trim()).with_context(|| {
                    "failed to decode session signing key from base64 (URL-safe)"
                })?;
                let bytes: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow!("session signing key must be 32 bytes"))?;
                SigningKey::from_bytes(&bytes)
            }
            None => generate_signing_key(),
        };
        Ok(Self {
            verifying_key: verifying_key_from(&signing_key),
            signing_key,
        })
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    fn verify(&self, token: &str) -> Option<SessionClaims> {
        let (payload, signature) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let signature = Signature::from_slice(&signature).ok()?;
        verify_signature(&self.verifying_key, &payload, &signature).ok()?;
        serde_json::from_slice(&payload).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    session_id: Uuid,
    user_id: Uuid,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The authenticated caller of a REST route.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Already resolved by the rate limiter.
        if let Some(user) = parts.extensions.get::<User>() {
            return Ok(AuthUser(user.clone()));
        }
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        match state.sessions().authenticate(token).await? {
            Some(user) => Ok(AuthUser(user)),
            None => Err(ApiError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    fn validate(self) -> Result<LoginAttempt, ApiError> {
        let username = self.username.trim().to_lowercase();
        if username.is_empty() {
            return Err(ApiError::invalid("username must be provided"));
        }
        if self.password.is_empty() {
            return Err(ApiError::invalid("password must be provided"));
        }
        Ok(LoginAttempt {
            username,
            password: self.password,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let attempt = payload.validate()?;
    match state.sessions().login(attempt).await? {
        Some(response) => Ok(Json(response)),
        None => Err(ApiError::Unauthorized),
    }
}

pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    if state.sessions().logout(token).await? {
        tracing::debug!(user_id = %user.id, "session revoked");
    }
    Ok(StatusCode::NO_CONTENT)
}

// Admin authentication: password hashing, JWT tokens and the request extractor.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{is_local_mode, LOCAL_USERNAME, LOCAL_USER_ID};
use crate::db::{Database, User};
use crate::error::is_unique_violation;

// ── JWT ──────────────────────────────────────────────────────────────

fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "trivia-dev-secret-change-in-production".to_string())
        .into_bytes()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: i64, // user id
    pub username: String,
    pub role: String,
    pub exp: usize, // expiry (unix timestamp)
}

pub fn create_token(user_id: i64, username: &str, role: &str) -> Result<String, String> {
    let expiration = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;

    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role: role.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

fn local_claims() -> Claims {
    Claims {
        sub: LOCAL_USER_ID,
        username: LOCAL_USERNAME.to_string(),
        role: "admin".to_string(),
        exp: usize::MAX,
    }
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// The authenticated session administrator.
/// In local mode every request acts as the local admin.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

fn unauthorized(msg: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": msg})),
    )
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if is_local_mode() {
            return Ok(AuthUser(local_claims()));
        }

        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing Authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Invalid Authorization header format"))?;

        verify_token(token)
            .map(AuthUser)
            .map_err(|_| unauthorized("Invalid token"))
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPublic,
}

#[derive(Serialize)]
pub struct UserPublic {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub created_at: String,
}

impl From<User> for UserPublic {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            display_name: user.display_name,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

fn error_response(status: StatusCode, msg: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({"error": msg}))).into_response()
}

fn token_response(status: StatusCode, user: User) -> axum::response::Response {
    match create_token(user.id, &user.username, &user.role) {
        Ok(token) => (
            status,
            Json(serde_json::json!(AuthResponse {
                token,
                user: user.into(),
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Token creation error: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

pub async fn register(
    State(db): State<Arc<Database>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if req.username.is_empty() || req.password.is_empty() || req.email.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "username, email, and password are required",
        );
    }
    if req.username.len() < 3 || req.username.len() > 30 {
        return error_response(StatusCode::BAD_REQUEST, "username must be 3-30 characters");
    }
    if req.password.len() < 8 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "password must be at least 8 characters",
        );
    }

    let password_hash = match hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("Password hash error: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    let display_name = req.display_name.unwrap_or_else(|| req.username.clone());

    match db
        .create_user(&req.username, &req.email, &password_hash, &display_name)
        .await
    {
        Ok(user) => {
            tracing::info!(user_id = user.id, "Admin registered");
            token_response(StatusCode::CREATED, user)
        }
        Err(e) if is_unique_violation(&e) => {
            error_response(StatusCode::CONFLICT, "Username or email already taken")
        }
        Err(e) => {
            tracing::error!("DB error in register: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

pub async fn login(
    State(db): State<Arc<Database>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let user = match db.get_user_by_username(&req.username).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return error_response(StatusCode::UNAUTHORIZED, "Invalid username or password");
        }
        Err(e) => {
            tracing::error!("DB error in login: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    let Some(ref password_hash) = user.password_hash else {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid username or password");
    };

    match verify_password(&req.password, password_hash) {
        Ok(true) => token_response(StatusCode::OK, user),
        Ok(false) => error_response(StatusCode::UNAUTHORIZED, "Invalid username or password"),
        Err(e) => {
            tracing::error!("Password verify error: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

pub async fn me(AuthUser(claims): AuthUser, State(db): State<Arc<Database>>) -> impl IntoResponse {
    match db.get_user(claims.sub).await {
        Ok(Some(user)) => (StatusCode::OK, Json(serde_json::json!(UserPublic::from(user)))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => {
            tracing::error!("DB error: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

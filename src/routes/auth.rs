/**
 * Authentication Routes
 * Sign-up with emailed confirmation codes, exchanged for JWT bearer tokens
 */
use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::distr::{Alphanumeric, SampleString};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{self, models::User};
use crate::routes::{
    db_error, db_unavailable, not_found, validation_error, ErrorReply, ErrorResponse,
};

// ============================================================================
// Configuration
// ============================================================================

lazy_static::lazy_static! {
    /// JWT secret key from environment
    pub static ref JWT_SECRET: String = std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "default-jwt-secret-change-in-production".to_string());

    /// Allowed username characters, same alphabet the lookup URLs accept
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[\w.@+-]+$").unwrap();
}

/// Access token expiry in hours
const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 24;

/// Confirmation code expiry in hours
const CONFIRMATION_CODE_EXPIRY_HOURS: i64 = 24;

/// Length of generated confirmation codes
const CONFIRMATION_CODE_LENGTH: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,      // User ID
    pub username: String, // Username
    pub role: String,     // User role
    pub exp: i64,         // Expiry timestamp
    pub iat: i64,         // Issued at timestamp
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SignUpRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub email: String,
    pub username: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub confirmation_code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// ============================================================================
// Tokens and codes
// ============================================================================

/// Create an access token for a user
pub fn create_access_token(user: &User) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::hours(ACCESS_TOKEN_EXPIRY_HOURS);

    let claims = Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        role: user.role.clone(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
}

/// Verify and decode an access token
pub fn verify_access_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Generate a random confirmation code
fn generate_confirmation_code() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), CONFIRMATION_CODE_LENGTH)
}

/// Hash a confirmation code for storage. Only the SHA-256 digest is kept so
/// a database leak does not expose live codes.
fn hash_confirmation_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Store (or replace) the pending confirmation code for a user.
async fn store_confirmation_code<'e, E>(
    executor: E,
    user_id: Uuid,
    code_hash: &str,
) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let expires_at = Utc::now() + Duration::hours(CONFIRMATION_CODE_EXPIRY_HOURS);
    sqlx::query(
        r#"
        INSERT INTO confirmation_codes (user_id, code_hash, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id)
            DO UPDATE SET code_hash = $2, expires_at = $3, created_at = now()
        "#,
    )
    .bind(user_id)
    .bind(code_hash)
    .bind(expires_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Hand the code to the out-of-band channel. Real email delivery is out of
/// scope; the application log stands in for it, like a console mail backend.
fn deliver_confirmation_code(username: &str, email: &str, code: &str) {
    tracing::info!(
        username = %username,
        email = %email,
        "confirmation code issued: {}",
        code
    );
}

// ============================================================================
// Validation
// ============================================================================

pub fn validate_username(username: &str) -> Result<(), ErrorReply> {
    if username.is_empty() {
        return Err(validation_error("username", "Username is required"));
    }
    if username.len() > 150 {
        return Err(validation_error(
            "username",
            "Username must be at most 150 characters",
        ));
    }
    if !USERNAME_REGEX.is_match(username) {
        return Err(validation_error(
            "username",
            "Username may contain only letters, digits and @ . + - _",
        ));
    }
    if username.eq_ignore_ascii_case("me") {
        return Err(validation_error(
            "username",
            "Username \"me\" is reserved",
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ErrorReply> {
    if email.is_empty() {
        return Err(validation_error("email", "Email is required"));
    }
    if email.len() > 254 {
        return Err(validation_error(
            "email",
            "Email must be at most 254 characters",
        ));
    }
    if !email.contains('@') {
        return Err(validation_error("email", "Invalid email format"));
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/auth/signup
/// Create an account and issue a confirmation code. If the exact
/// (username, email) pair already exists, a fresh code is re-sent instead
/// of reporting an error.
pub async fn signup(Json(payload): Json<SignUpRequest>) -> Result<impl IntoResponse, ErrorReply> {
    validate_username(&payload.username)?;
    validate_email(&payload.email)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM users WHERE username = $1 AND email = $2")
            .bind(&payload.username)
            .bind(&payload.email)
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| db_error("checking existing signup", e))?;

    if let Some((user_id,)) = existing {
        let code = generate_confirmation_code();
        store_confirmation_code(pool.as_ref(), user_id, &hash_confirmation_code(&code))
            .await
            .map_err(|e| db_error("re-issuing confirmation code", e))?;
        deliver_confirmation_code(&payload.username, &payload.email, &code);

        return Ok((
            StatusCode::OK,
            Json(SignUpResponse {
                email: payload.email,
                username: payload.username,
            }),
        ));
    }

    let (username_taken, email_taken): (bool, bool) = sqlx::query_as(
        r#"
        SELECT EXISTS (SELECT 1 FROM users WHERE username = $1),
               EXISTS (SELECT 1 FROM users WHERE email = $2)
        "#,
    )
    .bind(&payload.username)
    .bind(&payload.email)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("checking username/email uniqueness", e))?;

    if username_taken {
        return Err(validation_error(
            "username",
            "A user with that username already exists",
        ));
    }
    if email_taken {
        return Err(validation_error(
            "email",
            "A user with that email already exists",
        ));
    }

    // User row and its confirmation code are written atomically.
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("starting signup transaction", e))?;

    let (user_id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO users (username, email) VALUES ($1, $2) RETURNING id",
    )
    .bind(&payload.username)
    .bind(&payload.email)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if crate::routes::is_unique_violation(&e) {
            validation_error("username", "A user with that username or email already exists")
        } else {
            db_error("creating user", e)
        }
    })?;

    let code = generate_confirmation_code();
    store_confirmation_code(&mut *tx, user_id, &hash_confirmation_code(&code))
        .await
        .map_err(|e| db_error("storing confirmation code", e))?;

    tx.commit()
        .await
        .map_err(|e| db_error("committing signup", e))?;

    deliver_confirmation_code(&payload.username, &payload.email, &code);
    tracing::info!("New account registered: {}", payload.username);

    Ok((
        StatusCode::OK,
        Json(SignUpResponse {
            email: payload.email,
            username: payload.username,
        }),
    ))
}

/// POST /api/v1/auth/token
/// Exchange (username, confirmation_code) for a bearer token. Codes are
/// single-use and expire.
pub async fn issue_token(
    Json(payload): Json<TokenRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    if payload.username.is_empty() {
        return Err(validation_error("username", "Username is required"));
    }
    if payload.confirmation_code.is_empty() {
        return Err(validation_error(
            "confirmation_code",
            "Confirmation code is required",
        ));
    }

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    // Unknown username is 404, matching every other lookup endpoint.
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, email, first_name, last_name, bio, role, is_superuser, created_at
        FROM users
        WHERE username = $1
        "#,
    )
    .bind(&payload.username)
    .fetch_optional(pool.as_ref())
    .await
    .map_err(|e| db_error("looking up user for token", e))?
    .ok_or_else(not_found)?;

    let pending: Option<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT code_hash, expires_at FROM confirmation_codes WHERE user_id = $1")
            .bind(user.id)
            .fetch_optional(pool.as_ref())
            .await
            .map_err(|e| db_error("looking up confirmation code", e))?;

    let valid = matches!(
        &pending,
        Some((hash, expires_at))
            if *hash == hash_confirmation_code(&payload.confirmation_code)
                && *expires_at > Utc::now()
    );

    if !valid {
        return Err(validation_error(
            "confirmation_code",
            "Invalid or expired confirmation code",
        ));
    }

    // Single use: consume the code before handing out the token.
    sqlx::query("DELETE FROM confirmation_codes WHERE user_id = $1")
        .bind(user.id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("consuming confirmation code", e))?;

    let token = create_access_token(&user).map_err(|e| {
        tracing::error!("Failed to create access token: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to create token".to_string(),
                field: None,
            }),
        )
    })?;

    tracing::info!("Token issued for user: {}", user.username);

    Ok((StatusCode::OK, Json(TokenResponse { token })))
}

/**
 * User Routes
 * Admin-only account management plus the caller's own /users/me profile
 */
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::routes::auth::{validate_email, validate_username};
use crate::routes::permissions::{authenticate, require_admin, Role};
use crate::routes::{
    bad_request, db_error, db_unavailable, is_unique_violation, not_found, page_bounds,
    patch_field, validation_error, ErrorReply, PageResponse, SuccessResponse,
};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// User as served to clients.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserBody {
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub role: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub role: Option<String>,
}

/// Nullable fields distinguish `null` (clear) from absent (keep) so a bio
/// or name can be removed once set.
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(default, deserialize_with = "patch_field")]
    pub first_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub last_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "patch_field")]
    pub bio: Option<Option<String>>,
    pub role: Option<String>,
}

const USER_SELECT: &str =
    "SELECT username, email, first_name, last_name, bio, role FROM users";

fn validate_role(role: &str) -> Result<(), ErrorReply> {
    if Role::is_known(role) {
        Ok(())
    } else {
        Err(validation_error(
            "role",
            "Role must be one of: user, moderator, admin",
        ))
    }
}

// ============================================================================
// Admin management handlers
// ============================================================================

/// GET /api/v1/users - list with optional username prefix search (admin only)
pub async fn list_users(
    headers: HeaderMap,
    Query(query): Query<UserListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);

    let results = sqlx::query_as::<_, UserBody>(&format!(
        r#"
        {}
        WHERE ($1::TEXT IS NULL OR username LIKE $1 || '%')
        ORDER BY created_at, username
        LIMIT $2 OFFSET $3
        "#,
        USER_SELECT
    ))
    .bind(&query.search)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .map_err(|e| db_error("listing users", e))?;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM users WHERE ($1::TEXT IS NULL OR username LIKE $1 || '%')",
    )
    .bind(&query.search)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("counting users", e))?;

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/users - create an account directly, role included (admin only)
pub async fn create_user(
    headers: HeaderMap,
    Json(payload): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    validate_username(&payload.username)?;
    validate_email(&payload.email)?;
    let role = payload.role.unwrap_or_else(|| "user".to_string());
    validate_role(&role)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = sqlx::query_as::<_, UserBody>(
        r#"
        INSERT INTO users (username, email, first_name, last_name, bio, role)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING username, email, first_name, last_name, bio, role
        "#,
    )
    .bind(&payload.username)
    .bind(&payload.email)
    .bind(&payload.first_name)
    .bind(&payload.last_name)
    .bind(&payload.bio)
    .bind(&role)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            bad_request("A user with that username or email already exists")
        } else {
            db_error("creating user", e)
        }
    })?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/v1/users/{username} (admin only)
pub async fn get_user(
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = sqlx::query_as::<_, UserBody>(&format!("{} WHERE username = $1", USER_SELECT))
        .bind(&username)
        .fetch_optional(pool.as_ref())
        .await
        .map_err(|e| db_error("loading user", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// PATCH /api/v1/users/{username} - partial update, role changes allowed
/// (admin only)
pub async fn update_user(
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let existing = sqlx::query_as::<_, UserBody>(&format!("{} WHERE username = $1", USER_SELECT))
        .bind(&username)
        .fetch_optional(pool.as_ref())
        .await
        .map_err(|e| db_error("loading user for update", e))?
        .ok_or_else(not_found)?;

    let new_username = match payload.username {
        Some(u) => {
            validate_username(&u)?;
            u
        }
        None => existing.username,
    };
    let email = match payload.email {
        Some(e) => {
            validate_email(&e)?;
            e
        }
        None => existing.email,
    };
    let role = match payload.role {
        Some(r) => {
            validate_role(&r)?;
            r
        }
        None => existing.role,
    };
    let first_name = payload.first_name.unwrap_or(existing.first_name);
    let last_name = payload.last_name.unwrap_or(existing.last_name);
    let bio = payload.bio.unwrap_or(existing.bio);

    let body = sqlx::query_as::<_, UserBody>(
        r#"
        UPDATE users
        SET username = $1, email = $2, first_name = $3, last_name = $4, bio = $5, role = $6
        WHERE username = $7
        RETURNING username, email, first_name, last_name, bio, role
        "#,
    )
    .bind(&new_username)
    .bind(&email)
    .bind(&first_name)
    .bind(&last_name)
    .bind(&bio)
    .bind(&role)
    .bind(&username)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            bad_request("A user with that username or email already exists")
        } else {
            db_error("updating user", e)
        }
    })?;

    Ok((StatusCode::OK, Json(body)))
}

/// DELETE /api/v1/users/{username} - cascades to the user's reviews and
/// comments (admin only)
pub async fn delete_user(
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let result = sqlx::query("DELETE FROM users WHERE username = $1")
        .bind(&username)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting user", e))?;

    if result.rows_affected() == 0 {
        return Err(not_found());
    }

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })))
}

// ============================================================================
// Self-service profile handlers
// ============================================================================

/// GET /api/v1/users/me - the caller's own profile
pub async fn get_me(headers: HeaderMap) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    Ok((
        StatusCode::OK,
        Json(UserBody {
            username: caller.username,
            email: caller.email,
            first_name: caller.first_name,
            last_name: caller.last_name,
            bio: caller.bio,
            role: caller.role,
        }),
    ))
}

/// PATCH /api/v1/users/me - update own profile; any `role` field is ignored
/// so users cannot promote themselves
pub async fn update_me(
    headers: HeaderMap,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    if payload.role.is_some() {
        tracing::debug!("Ignoring role field in /users/me update for {}", caller.username);
    }

    let new_username = match payload.username {
        Some(u) => {
            validate_username(&u)?;
            u
        }
        None => caller.username.clone(),
    };
    let email = match payload.email {
        Some(e) => {
            validate_email(&e)?;
            e
        }
        None => caller.email,
    };
    let first_name = payload.first_name.unwrap_or(caller.first_name);
    let last_name = payload.last_name.unwrap_or(caller.last_name);
    let bio = payload.bio.unwrap_or(caller.bio);

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = sqlx::query_as::<_, UserBody>(
        r#"
        UPDATE users
        SET username = $1, email = $2, first_name = $3, last_name = $4, bio = $5
        WHERE id = $6
        RETURNING username, email, first_name, last_name, bio, role
        "#,
    )
    .bind(&new_username)
    .bind(&email)
    .bind(&first_name)
    .bind(&last_name)
    .bind(&bio)
    .bind(caller.id)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            bad_request("A user with that username or email already exists")
        } else {
            db_error("updating own profile", e)
        }
    })?;

    Ok((StatusCode::OK, Json(body)))
}

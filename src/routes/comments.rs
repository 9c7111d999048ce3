/**
 * Comment Routes
 * Short comments nested under a review (which is itself nested under a title)
 */
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::db;
use crate::routes::permissions::{authenticate, can_modify_object, forbidden};
use crate::routes::{
    db_error, db_unavailable, not_found, page_bounds, validation_error, ErrorReply, PageResponse,
    SuccessResponse,
};

/// Upper bound on comment length, reviews are the place for essays.
const MAX_COMMENT_LENGTH: usize = 155;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CommentListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Comment as served to clients; `author` is the username.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommentBody {
    pub id: i64,
    pub text: String,
    pub author: String,
    pub pub_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateCommentRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCommentRequest {
    pub text: Option<String>,
}

// ============================================================================
// Validation and lookups
// ============================================================================

pub fn validate_comment_text(text: &str) -> Result<(), ErrorReply> {
    if text.trim().is_empty() {
        return Err(validation_error("text", "Text is required"));
    }
    if text.chars().count() > MAX_COMMENT_LENGTH {
        return Err(validation_error(
            "text",
            "Comment must be at most 155 characters",
        ));
    }
    Ok(())
}

/// 404 unless the review exists under this exact title.
async fn ensure_review_exists(
    pool: &PgPool,
    title_id: i64,
    review_id: i64,
) -> Result<(), ErrorReply> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM reviews WHERE id = $1 AND title_id = $2)",
    )
    .bind(review_id)
    .bind(title_id)
    .fetch_one(pool)
    .await
    .map_err(|e| db_error("checking review existence", e))?;

    if exists {
        Ok(())
    } else {
        Err(not_found())
    }
}

async fn load_comment_body(
    pool: &PgPool,
    review_id: i64,
    comment_id: i64,
) -> Result<Option<CommentBody>, sqlx::Error> {
    sqlx::query_as::<_, CommentBody>(
        r#"
        SELECT c.id, c.text, u.username AS author, c.pub_date
        FROM comments c
        JOIN users u ON u.id = c.author_id
        WHERE c.id = $1 AND c.review_id = $2
        "#,
    )
    .bind(comment_id)
    .bind(review_id)
    .fetch_optional(pool)
    .await
}

async fn load_comment_scoped(
    pool: &PgPool,
    title_id: i64,
    review_id: i64,
    comment_id: i64,
) -> Result<db::models::Comment, ErrorReply> {
    ensure_review_exists(pool, title_id, review_id).await?;

    sqlx::query_as::<_, db::models::Comment>(
        r#"
        SELECT id, review_id, author_id, text, pub_date
        FROM comments
        WHERE id = $1 AND review_id = $2
        "#,
    )
    .bind(comment_id)
    .bind(review_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| db_error("loading comment", e))?
    .ok_or_else(not_found)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/titles/{title_id}/reviews/{review_id}/comments - newest first
pub async fn list_comments(
    Path((title_id, review_id)): Path<(i64, i64)>,
    Query(query): Query<CommentListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    ensure_review_exists(pool.as_ref(), title_id, review_id).await?;

    let (limit, offset) = page_bounds(query.limit, query.offset);

    let results = sqlx::query_as::<_, CommentBody>(
        r#"
        SELECT c.id, c.text, u.username AS author, c.pub_date
        FROM comments c
        JOIN users u ON u.id = c.author_id
        WHERE c.review_id = $1
        ORDER BY c.pub_date DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(review_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .map_err(|e| db_error("listing comments", e))?;

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM comments WHERE review_id = $1")
        .bind(review_id)
        .fetch_one(pool.as_ref())
        .await
        .map_err(|e| db_error("counting comments", e))?;

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/titles/{title_id}/reviews/{review_id}/comments - any
/// authenticated user
pub async fn create_comment(
    headers: HeaderMap,
    Path((title_id, review_id)): Path<(i64, i64)>,
    Json(payload): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    validate_comment_text(&payload.text)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    ensure_review_exists(pool.as_ref(), title_id, review_id).await?;

    let (id, pub_date): (i64, DateTime<Utc>) = sqlx::query_as(
        r#"
        INSERT INTO comments (review_id, author_id, text)
        VALUES ($1, $2, $3)
        RETURNING id, pub_date
        "#,
    )
    .bind(review_id)
    .bind(caller.id)
    .bind(&payload.text)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("creating comment", e))?;

    Ok((
        StatusCode::CREATED,
        Json(CommentBody {
            id,
            text: payload.text,
            author: caller.username,
            pub_date,
        }),
    ))
}

/// GET /api/v1/titles/{title_id}/reviews/{review_id}/comments/{comment_id}
pub async fn get_comment(
    Path((title_id, review_id, comment_id)): Path<(i64, i64, i64)>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    ensure_review_exists(pool.as_ref(), title_id, review_id).await?;

    let body = load_comment_body(pool.as_ref(), review_id, comment_id)
        .await
        .map_err(|e| db_error("loading comment", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// PATCH .../comments/{comment_id} - author, moderator or admin
pub async fn update_comment(
    headers: HeaderMap,
    Path((title_id, review_id, comment_id)): Path<(i64, i64, i64)>,
    Json(payload): Json<UpdateCommentRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let existing = load_comment_scoped(pool.as_ref(), title_id, review_id, comment_id).await?;

    if !can_modify_object(&caller, existing.author_id) {
        return Err(forbidden());
    }

    let text = match payload.text {
        Some(text) => {
            validate_comment_text(&text)?;
            text
        }
        None => existing.text,
    };

    sqlx::query("UPDATE comments SET text = $1 WHERE id = $2")
        .bind(&text)
        .bind(comment_id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("updating comment", e))?;

    let body = load_comment_body(pool.as_ref(), review_id, comment_id)
        .await
        .map_err(|e| db_error("loading updated comment", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// DELETE .../comments/{comment_id} - author, moderator or admin
pub async fn delete_comment(
    headers: HeaderMap,
    Path((title_id, review_id, comment_id)): Path<(i64, i64, i64)>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let existing = load_comment_scoped(pool.as_ref(), title_id, review_id, comment_id).await?;

    if !can_modify_object(&caller, existing.author_id) {
        return Err(forbidden());
    }

    sqlx::query("DELETE FROM comments WHERE id = $1")
        .bind(existing.id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting comment", e))?;

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn comment_router() -> Router {
        Router::new()
            .route(
                "/api/v1/titles/{title_id}/reviews/{review_id}/comments",
                get(list_comments).post(create_comment),
            )
            .route(
                "/api/v1/titles/{title_id}/reviews/{review_id}/comments/{comment_id}",
                get(get_comment)
                    .patch(update_comment)
                    .delete(delete_comment),
            )
    }

    #[test]
    fn test_comment_text_bounds() {
        assert!(validate_comment_text("nice take").is_ok());
        assert!(validate_comment_text("").is_err());
        assert!(validate_comment_text(&"x".repeat(155)).is_ok());
        assert!(validate_comment_text(&"x".repeat(156)).is_err());
    }

    #[tokio::test]
    async fn test_create_comment_without_token_returns_unauthorized() {
        let req = Request::post("/api/v1/titles/1/reviews/2/comments")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"text":"agreed"}"#))
            .unwrap();
        let res = comment_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_delete_comment_without_token_returns_unauthorized() {
        let req = Request::delete("/api/v1/titles/1/reviews/2/comments/3")
            .body(Body::empty())
            .unwrap();
        let res = comment_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_comments_without_database_returns_unavailable() {
        let req = Request::get("/api/v1/titles/1/reviews/2/comments")
            .body(Body::empty())
            .unwrap();
        let res = comment_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

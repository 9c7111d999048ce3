/**
 * Review Routes
 * Scored reviews nested under a title; one review per (title, author)
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
    bad_request, db_error, db_unavailable, is_unique_violation, not_found, page_bounds,
    validation_error, ErrorReply, PageResponse, SuccessResponse,
};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReviewListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Review as served to clients; `author` is the username.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReviewBody {
    pub id: i64,
    pub text: String,
    pub author: String,
    pub score: i32,
    pub pub_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateReviewRequest {
    #[serde(default)]
    pub text: String,
    pub score: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReviewRequest {
    pub text: Option<String>,
    pub score: Option<i32>,
}

// ============================================================================
// Validation and lookups
// ============================================================================

pub fn validate_score(score: i32) -> Result<(), ErrorReply> {
    if !(1..=10).contains(&score) {
        return Err(validation_error("score", "Score must be between 1 and 10"));
    }
    Ok(())
}

fn validate_text(text: &str) -> Result<(), ErrorReply> {
    if text.trim().is_empty() {
        return Err(validation_error("text", "Text is required"));
    }
    Ok(())
}

/// 404 unless the title exists; reviews only live under real titles.
async fn ensure_title_exists(pool: &PgPool, title_id: i64) -> Result<(), ErrorReply> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM titles WHERE id = $1)")
        .bind(title_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_error("checking title existence", e))?;

    if exists {
        Ok(())
    } else {
        Err(not_found())
    }
}

async fn load_review_body(
    pool: &PgPool,
    title_id: i64,
    review_id: i64,
) -> Result<Option<ReviewBody>, sqlx::Error> {
    sqlx::query_as::<_, ReviewBody>(
        r#"
        SELECT r.id, r.text, u.username AS author, r.score, r.pub_date
        FROM reviews r
        JOIN users u ON u.id = r.author_id
        WHERE r.id = $1 AND r.title_id = $2
        "#,
    )
    .bind(review_id)
    .bind(title_id)
    .fetch_optional(pool)
    .await
}

/// Load the raw review row scoped to its title, for permission checks.
async fn load_review_scoped(
    pool: &PgPool,
    title_id: i64,
    review_id: i64,
) -> Result<db::models::Review, ErrorReply> {
    sqlx::query_as::<_, db::models::Review>(
        r#"
        SELECT id, title_id, author_id, text, score, pub_date
        FROM reviews
        WHERE id = $1 AND title_id = $2
        "#,
    )
    .bind(review_id)
    .bind(title_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| db_error("loading review", e))?
    .ok_or_else(not_found)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/titles/{title_id}/reviews - newest first
pub async fn list_reviews(
    Path(title_id): Path<i64>,
    Query(query): Query<ReviewListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    ensure_title_exists(pool.as_ref(), title_id).await?;

    let (limit, offset) = page_bounds(query.limit, query.offset);

    let results = sqlx::query_as::<_, ReviewBody>(
        r#"
        SELECT r.id, r.text, u.username AS author, r.score, r.pub_date
        FROM reviews r
        JOIN users u ON u.id = r.author_id
        WHERE r.title_id = $1
        ORDER BY r.pub_date DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(title_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .map_err(|e| db_error("listing reviews", e))?;

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reviews WHERE title_id = $1")
        .bind(title_id)
        .fetch_one(pool.as_ref())
        .await
        .map_err(|e| db_error("counting reviews", e))?;

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/titles/{title_id}/reviews - any authenticated user, at most
/// one review per title
pub async fn create_review(
    headers: HeaderMap,
    Path(title_id): Path<i64>,
    Json(payload): Json<CreateReviewRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    validate_text(&payload.text)?;
    let score = payload
        .score
        .ok_or_else(|| validation_error("score", "Score is required"))?;
    validate_score(score)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    ensure_title_exists(pool.as_ref(), title_id).await?;

    // Existence check and insert share a transaction; the unique constraint
    // on (title_id, author_id) catches whatever races past the check.
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("starting review transaction", e))?;

    let (already_reviewed,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM reviews WHERE title_id = $1 AND author_id = $2)",
    )
    .bind(title_id)
    .bind(caller.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| db_error("checking for existing review", e))?;

    if already_reviewed {
        return Err(bad_request("You have already reviewed this title"));
    }

    let (id, pub_date): (i64, DateTime<Utc>) = sqlx::query_as(
        r#"
        INSERT INTO reviews (title_id, author_id, text, score)
        VALUES ($1, $2, $3, $4)
        RETURNING id, pub_date
        "#,
    )
    .bind(title_id)
    .bind(caller.id)
    .bind(&payload.text)
    .bind(score)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            bad_request("You have already reviewed this title")
        } else {
            db_error("creating review", e)
        }
    })?;

    tx.commit()
        .await
        .map_err(|e| db_error("committing review", e))?;

    Ok((
        StatusCode::CREATED,
        Json(ReviewBody {
            id,
            text: payload.text,
            author: caller.username,
            score,
            pub_date,
        }),
    ))
}

/// GET /api/v1/titles/{title_id}/reviews/{review_id}
pub async fn get_review(
    Path((title_id, review_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = load_review_body(pool.as_ref(), title_id, review_id)
        .await
        .map_err(|e| db_error("loading review", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// PATCH /api/v1/titles/{title_id}/reviews/{review_id} - author, moderator
/// or admin
pub async fn update_review(
    headers: HeaderMap,
    Path((title_id, review_id)): Path<(i64, i64)>,
    Json(payload): Json<UpdateReviewRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let existing = load_review_scoped(pool.as_ref(), title_id, review_id).await?;

    if !can_modify_object(&caller, existing.author_id) {
        return Err(forbidden());
    }

    let text = match payload.text {
        Some(text) => {
            validate_text(&text)?;
            text
        }
        None => existing.text,
    };
    let score = match payload.score {
        Some(score) => {
            validate_score(score)?;
            score
        }
        None => existing.score,
    };

    sqlx::query("UPDATE reviews SET text = $1, score = $2 WHERE id = $3")
        .bind(&text)
        .bind(score)
        .bind(review_id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("updating review", e))?;

    let body = load_review_body(pool.as_ref(), title_id, review_id)
        .await
        .map_err(|e| db_error("loading updated review", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// DELETE /api/v1/titles/{title_id}/reviews/{review_id} - author, moderator
/// or admin; cascades to comments
pub async fn delete_review(
    headers: HeaderMap,
    Path((title_id, review_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let existing = load_review_scoped(pool.as_ref(), title_id, review_id).await?;

    if !can_modify_object(&caller, existing.author_id) {
        return Err(forbidden());
    }

    sqlx::query("DELETE FROM reviews WHERE id = $1")
        .bind(existing.id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting review", e))?;

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

    fn review_router() -> Router {
        Router::new()
            .route(
                "/api/v1/titles/{title_id}/reviews",
                get(list_reviews).post(create_review),
            )
            .route(
                "/api/v1/titles/{title_id}/reviews/{review_id}",
                get(get_review).patch(update_review).delete(delete_review),
            )
    }

    #[test]
    fn test_score_bounds() {
        assert!(validate_score(1).is_ok());
        assert!(validate_score(10).is_ok());
        assert!(validate_score(0).is_err());
        assert!(validate_score(11).is_err());
        assert!(validate_score(-3).is_err());
    }

    #[test]
    fn test_review_text_required() {
        assert!(validate_text("Loved it").is_ok());
        assert!(validate_text("").is_err());
        assert!(validate_text("   ").is_err());
    }

    #[tokio::test]
    async fn test_create_review_without_token_returns_unauthorized() {
        let req = Request::post("/api/v1/titles/1/reviews")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"text":"great","score":9}"#))
            .unwrap();
        let res = review_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_patch_review_without_token_returns_unauthorized() {
        let req = Request::patch("/api/v1/titles/1/reviews/2")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"score":3}"#))
            .unwrap();
        let res = review_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_reviews_without_database_returns_unavailable() {
        let req = Request::get("/api/v1/titles/1/reviews")
            .body(Body::empty())
            .unwrap();
        let res = review_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

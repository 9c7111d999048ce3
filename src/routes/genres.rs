/**
 * Genre Routes
 * Slug-keyed tags attached to titles through the title_genres join table
 */
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::routes::permissions::{authenticate, require_admin};
use crate::routes::{
    db_error, db_unavailable, is_unique_violation, not_found, page_bounds, validate_name,
    validate_slug, validation_error, ErrorReply, PageResponse, SuccessResponse,
};

#[derive(Debug, Deserialize)]
pub struct GenreListQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct GenreBody {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateGenreRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// GET /api/v1/genres - list with optional name prefix search
pub async fn list_genres(
    Query(query): Query<GenreListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);

    let results = sqlx::query_as::<_, GenreBody>(
        r#"
        SELECT name, slug FROM genres
        WHERE ($1::TEXT IS NULL OR name LIKE $1 || '%')
        ORDER BY id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(&query.search)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .map_err(|e| db_error("listing genres", e))?;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM genres WHERE ($1::TEXT IS NULL OR name LIKE $1 || '%')",
    )
    .bind(&query.search)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("counting genres", e))?;

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/genres - create (admin only)
pub async fn create_genre(
    headers: HeaderMap,
    Json(payload): Json<CreateGenreRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    validate_name(&payload.name)?;
    validate_slug(&payload.slug)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = sqlx::query_as::<_, GenreBody>(
        "INSERT INTO genres (name, slug) VALUES ($1, $2) RETURNING name, slug",
    )
    .bind(&payload.name)
    .bind(&payload.slug)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            validation_error("slug", "Genre with that slug already exists")
        } else {
            db_error("creating genre", e)
        }
    })?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// DELETE /api/v1/genres/{slug} - delete (admin only).
/// Join rows referencing the genre are kept with genre set to null.
pub async fn delete_genre(
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let result = sqlx::query("DELETE FROM genres WHERE slug = $1")
        .bind(&slug)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting genre", e))?;

    if result.rows_affected() == 0 {
        return Err(not_found());
    }

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{delete, get};
    use axum::Router;
    use tower::ServiceExt;

    fn genre_router() -> Router {
        Router::new()
            .route("/api/v1/genres", get(list_genres).post(create_genre))
            .route("/api/v1/genres/{slug}", delete(delete_genre))
    }

    #[tokio::test]
    async fn test_create_genre_without_token_returns_unauthorized() {
        let req = Request::post("/api/v1/genres")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"Drama","slug":"drama"}"#))
            .unwrap();
        let res = genre_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_genre_with_garbage_token_returns_unauthorized() {
        let req = Request::post("/api/v1/genres")
            .header("content-type", "application/json")
            .header("authorization", "Bearer not.a.jwt")
            .body(Body::from(r#"{"name":"Drama","slug":"drama"}"#))
            .unwrap();
        let res = genre_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_genres_without_database_returns_unavailable() {
        let req = Request::get("/api/v1/genres?search=dra")
            .body(Body::empty())
            .unwrap();
        let res = genre_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

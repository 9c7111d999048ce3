/**
 * Category Routes
 * Slug-keyed reference entities grouping titles (film, book, music, ...)
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
pub struct CategoryListQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct CategoryBody {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateCategoryRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// GET /api/v1/categories - list with optional name prefix search
pub async fn list_categories(
    Query(query): Query<CategoryListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);

    let results = sqlx::query_as::<_, CategoryBody>(
        r#"
        SELECT name, slug FROM categories
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
    .map_err(|e| db_error("listing categories", e))?;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM categories WHERE ($1::TEXT IS NULL OR name LIKE $1 || '%')",
    )
    .bind(&query.search)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("counting categories", e))?;

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/categories - create (admin only)
pub async fn create_category(
    headers: HeaderMap,
    Json(payload): Json<CreateCategoryRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    validate_name(&payload.name)?;
    validate_slug(&payload.slug)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = sqlx::query_as::<_, CategoryBody>(
        "INSERT INTO categories (name, slug) VALUES ($1, $2) RETURNING name, slug",
    )
    .bind(&payload.name)
    .bind(&payload.slug)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            validation_error("slug", "Category with that slug already exists")
        } else {
            db_error("creating category", e)
        }
    })?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// DELETE /api/v1/categories/{slug} - delete (admin only).
/// Titles referencing the category keep existing with category set to null.
pub async fn delete_category(
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let result = sqlx::query("DELETE FROM categories WHERE slug = $1")
        .bind(&slug)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting category", e))?;

    if result.rows_affected() == 0 {
        return Err(not_found());
    }

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })))
}

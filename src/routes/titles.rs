/**
 * Title Routes
 * The reviewable catalog. Read responses carry a rating aggregated from
 * reviews on every read; genre membership fans out into title_genres rows
 * inside one transaction.
 */
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::db;
use crate::routes::categories::CategoryBody;
use crate::routes::genres::GenreBody;
use crate::routes::permissions::{authenticate, require_admin};
use crate::routes::{
    db_error, db_unavailable, not_found, page_bounds, patch_field, validate_name,
    validation_error, ErrorReply, PageResponse, SuccessResponse,
};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for GET /api/v1/titles (list)
#[derive(Debug, Deserialize)]
pub struct TitleListQuery {
    pub year: Option<i32>,
    /// Genre slug
    pub genre: Option<String>,
    /// Category slug
    pub category: Option<String>,
    /// Case-insensitive substring of the name
    pub name: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Full title response. `rating` is null until the first review lands.
#[derive(Debug, Serialize)]
pub struct TitleBody {
    pub id: i64,
    pub name: String,
    pub year: i32,
    pub rating: Option<i32>,
    pub description: Option<String>,
    pub genre: Vec<GenreBody>,
    pub category: Option<CategoryBody>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTitleRequest {
    #[serde(default)]
    pub name: String,
    pub year: Option<i32>,
    pub description: Option<String>,
    /// Genre slugs
    #[serde(default)]
    pub genre: Vec<String>,
    /// Category slug
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTitleRequest {
    pub name: Option<String>,
    pub year: Option<i32>,
    /// `null` clears the description; an absent field keeps it
    #[serde(default, deserialize_with = "patch_field")]
    pub description: Option<Option<String>>,
    /// When present, atomically replaces the whole genre set
    pub genre: Option<Vec<String>>,
    /// `null` detaches the category; an absent field keeps it
    #[serde(default, deserialize_with = "patch_field")]
    pub category: Option<Option<String>>,
}

/// Flat row shape shared by the list and detail queries. The rating
/// subquery recomputes round(avg(score)) on every read; nothing is cached.
#[derive(Debug, sqlx::FromRow)]
struct TitleRow {
    id: i64,
    name: String,
    year: i32,
    description: Option<String>,
    rating: Option<i32>,
    category_name: Option<String>,
    category_slug: Option<String>,
}

const TITLE_SELECT: &str = r#"
    SELECT t.id, t.name, t.year, t.description,
           (SELECT CAST(ROUND(AVG(r.score)) AS INT)
              FROM reviews r WHERE r.title_id = t.id) AS rating,
           c.name AS category_name, c.slug AS category_slug
    FROM titles t
    LEFT JOIN categories c ON c.id = t.category_id
"#;

// ============================================================================
// Validation and slug resolution
// ============================================================================

pub fn validate_year(year: i32) -> Result<(), ErrorReply> {
    if year > Utc::now().year() {
        return Err(validation_error("year", "Year cannot be in the future"));
    }
    Ok(())
}

/// Resolve a category slug to its id; unknown slugs are a client error.
async fn resolve_category(pool: &PgPool, slug: &str) -> Result<i64, ErrorReply> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM categories WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_error("resolving category slug", e))?;

    match row {
        Some((id,)) => Ok(id),
        None => Err(validation_error(
            "category",
            &format!("Unknown category slug: {}", slug),
        )),
    }
}

/// Resolve genre slugs to ids, rejecting the whole request on the first
/// unknown slug so no partial fan-out can happen.
async fn resolve_genres(pool: &PgPool, slugs: &[String]) -> Result<Vec<i64>, ErrorReply> {
    if slugs.is_empty() {
        return Ok(vec![]);
    }

    let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, slug FROM genres WHERE slug = ANY($1)")
        .bind(slugs)
        .fetch_all(pool)
        .await
        .map_err(|e| db_error("resolving genre slugs", e))?;

    let by_slug: HashMap<&str, i64> = rows.iter().map(|(id, s)| (s.as_str(), *id)).collect();

    let mut ids = Vec::with_capacity(slugs.len());
    for slug in slugs {
        match by_slug.get(slug.as_str()) {
            Some(id) => ids.push(*id),
            None => {
                return Err(validation_error(
                    "genre",
                    &format!("Unknown genre slug: {}", slug),
                ));
            }
        }
    }
    Ok(ids)
}

// ============================================================================
// Assembly
// ============================================================================

/// Fetch the genre bodies for a set of titles, grouped by title id.
/// Join rows whose genre was deleted (genre_id null) do not surface.
async fn genres_for_titles(
    pool: &PgPool,
    title_ids: &[i64],
) -> Result<HashMap<i64, Vec<GenreBody>>, sqlx::Error> {
    if title_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(i64, String, String)> = sqlx::query_as(
        r#"
        SELECT tg.title_id, g.name, g.slug
        FROM title_genres tg
        JOIN genres g ON g.id = tg.genre_id
        WHERE tg.title_id = ANY($1)
        ORDER BY g.id
        "#,
    )
    .bind(title_ids)
    .fetch_all(pool)
    .await?;

    let mut grouped: HashMap<i64, Vec<GenreBody>> = HashMap::new();
    for (title_id, name, slug) in rows {
        grouped
            .entry(title_id)
            .or_default()
            .push(GenreBody { name, slug });
    }
    Ok(grouped)
}

fn assemble(row: TitleRow, genre: Vec<GenreBody>) -> TitleBody {
    let category = match (row.category_name, row.category_slug) {
        (Some(name), Some(slug)) => Some(CategoryBody { name, slug }),
        _ => None,
    };
    TitleBody {
        id: row.id,
        name: row.name,
        year: row.year,
        rating: row.rating,
        description: row.description,
        genre,
        category,
    }
}

async fn load_title_body(pool: &PgPool, id: i64) -> Result<Option<TitleBody>, sqlx::Error> {
    let row = sqlx::query_as::<_, TitleRow>(&format!("{} WHERE t.id = $1", TITLE_SELECT))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let mut genres = genres_for_titles(pool, &[id]).await?;
    Ok(Some(assemble(row, genres.remove(&id).unwrap_or_default())))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/titles - list with year/genre/category/name filters
pub async fn list_titles(
    Query(query): Query<TitleListQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);

    const FILTERS: &str = r#"
        WHERE ($1::INT IS NULL OR t.year = $1)
          AND ($2::TEXT IS NULL OR c.slug = $2)
          AND ($3::TEXT IS NULL OR EXISTS (
                SELECT 1 FROM title_genres tg
                JOIN genres g ON g.id = tg.genre_id
                WHERE tg.title_id = t.id AND g.slug = $3))
          AND ($4::TEXT IS NULL OR t.name ILIKE '%' || $4 || '%')
    "#;

    let rows = sqlx::query_as::<_, TitleRow>(&format!(
        "{} {} ORDER BY t.id LIMIT $5 OFFSET $6",
        TITLE_SELECT, FILTERS
    ))
    .bind(query.year)
    .bind(&query.category)
    .bind(&query.genre)
    .bind(&query.name)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .map_err(|e| db_error("listing titles", e))?;

    let (count,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM titles t LEFT JOIN categories c ON c.id = t.category_id {}",
        FILTERS
    ))
    .bind(query.year)
    .bind(&query.category)
    .bind(&query.genre)
    .bind(&query.name)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| db_error("counting titles", e))?;

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let mut genres = genres_for_titles(pool.as_ref(), &ids)
        .await
        .map_err(|e| db_error("loading title genres", e))?;

    let results: Vec<TitleBody> = rows
        .into_iter()
        .map(|row| {
            let genre = genres.remove(&row.id).unwrap_or_default();
            assemble(row, genre)
        })
        .collect();

    Ok((StatusCode::OK, Json(PageResponse { count, results })))
}

/// POST /api/v1/titles - create with genre fan-out (admin only)
pub async fn create_title(
    headers: HeaderMap,
    Json(payload): Json<CreateTitleRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    validate_name(&payload.name)?;
    let year = payload
        .year
        .ok_or_else(|| validation_error("year", "Year is required"))?;
    validate_year(year)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let category_id = match &payload.category {
        Some(slug) => Some(resolve_category(pool.as_ref(), slug).await?),
        None => None,
    };
    let genre_ids = resolve_genres(pool.as_ref(), &payload.genre).await?;

    // Title row and its join rows land together or not at all.
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("starting title transaction", e))?;

    let (title_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO titles (name, year, description, category_id)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&payload.name)
    .bind(year)
    .bind(&payload.description)
    .bind(category_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| db_error("creating title", e))?;

    for genre_id in &genre_ids {
        sqlx::query(
            r#"
            INSERT INTO title_genres (title_id, genre_id)
            VALUES ($1, $2)
            ON CONFLICT (title_id, genre_id) DO NOTHING
            "#,
        )
        .bind(title_id)
        .bind(genre_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("attaching genre to title", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| db_error("committing title", e))?;

    let body = load_title_body(pool.as_ref(), title_id)
        .await
        .map_err(|e| db_error("loading created title", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/v1/titles/{id}
pub async fn get_title(Path(id): Path<i64>) -> Result<impl IntoResponse, ErrorReply> {
    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let body = load_title_body(pool.as_ref(), id)
        .await
        .map_err(|e| db_error("loading title", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// PATCH /api/v1/titles/{id} - update; a genre list replaces the join set
/// atomically (admin only)
pub async fn update_title(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateTitleRequest>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let existing = sqlx::query_as::<_, db::models::Title>(
        "SELECT id, name, year, description, category_id FROM titles WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await
    .map_err(|e| db_error("loading title for update", e))?
    .ok_or_else(not_found)?;

    let name = match payload.name {
        Some(name) => {
            validate_name(&name)?;
            name
        }
        None => existing.name,
    };
    let year = match payload.year {
        Some(year) => {
            validate_year(year)?;
            year
        }
        None => existing.year,
    };
    let description = match payload.description {
        Some(description) => description,
        None => existing.description,
    };
    let category_id = match payload.category {
        Some(Some(slug)) => Some(resolve_category(pool.as_ref(), &slug).await?),
        Some(None) => None,
        None => existing.category_id,
    };
    let genre_ids = match &payload.genre {
        Some(slugs) => Some(resolve_genres(pool.as_ref(), slugs).await?),
        None => None,
    };

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("starting title update transaction", e))?;

    sqlx::query(
        r#"
        UPDATE titles
        SET name = $1, year = $2, description = $3, category_id = $4
        WHERE id = $5
        "#,
    )
    .bind(&name)
    .bind(year)
    .bind(&description)
    .bind(category_id)
    .bind(id)
    .execute(&mut *tx)
    .await
    .map_err(|e| db_error("updating title", e))?;

    if let Some(genre_ids) = genre_ids {
        sqlx::query("DELETE FROM title_genres WHERE title_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clearing title genres", e))?;

        for genre_id in &genre_ids {
            sqlx::query(
                r#"
                INSERT INTO title_genres (title_id, genre_id)
                VALUES ($1, $2)
                ON CONFLICT (title_id, genre_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(genre_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("attaching genre to title", e))?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| db_error("committing title update", e))?;

    let body = load_title_body(pool.as_ref(), id)
        .await
        .map_err(|e| db_error("loading updated title", e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(body)))
}

/// DELETE /api/v1/titles/{id} - cascades to reviews and comments (admin only)
pub async fn delete_title(
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ErrorReply> {
    let caller = authenticate(&headers).await?;
    require_admin(&caller)?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let result = sqlx::query("DELETE FROM titles WHERE id = $1")
        .bind(id)
        .execute(pool.as_ref())
        .await
        .map_err(|e| db_error("deleting title", e))?;

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
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn title_router() -> Router {
        Router::new()
            .route("/api/v1/titles", get(list_titles).post(create_title))
            .route(
                "/api/v1/titles/{id}",
                get(get_title).patch(update_title).delete(delete_title),
            )
    }

    #[test]
    fn test_patch_distinguishes_null_from_absent() {
        let clearing: UpdateTitleRequest =
            serde_json::from_str(r#"{"description":null,"category":null}"#).unwrap();
        assert_eq!(clearing.description, Some(None));
        assert_eq!(clearing.category, Some(None));

        let untouched: UpdateTitleRequest = serde_json::from_str(r#"{"year":1999}"#).unwrap();
        assert_eq!(untouched.description, None);
        assert_eq!(untouched.category, None);

        let setting: UpdateTitleRequest =
            serde_json::from_str(r#"{"description":"restored print"}"#).unwrap();
        assert_eq!(setting.description, Some(Some("restored print".to_string())));
    }

    #[test]
    fn test_future_year_rejected() {
        assert!(validate_year(2999).is_err());
        assert!(validate_year(Utc::now().year()).is_ok());
        assert!(validate_year(1895).is_ok());
    }

    #[tokio::test]
    async fn test_create_title_without_token_returns_unauthorized() {
        let req = Request::post("/api/v1/titles")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"X","year":2020}"#))
            .unwrap();
        let res = title_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_delete_title_without_token_returns_unauthorized() {
        let req = Request::delete("/api/v1/titles/1")
            .body(Body::empty())
            .unwrap();
        let res = title_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_titles_without_database_returns_unavailable() {
        let req = Request::get("/api/v1/titles?year=2020&genre=drama")
            .body(Body::empty())
            .unwrap();
        let res = title_router().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

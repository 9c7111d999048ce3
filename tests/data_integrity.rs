//! Database-backed integration tests for the invariants the API enforces
//! in SQL: rating aggregation, review uniqueness, genre fan-out atomicity
//! and detach-on-delete for categories and genres.
//!
//! They need TEST_DATABASE_URL pointing at a disposable Postgres database;
//! when it is unset every test returns early and does nothing.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use media_review_backend::create_app;
use media_review_backend::db::{self, models::User, DbConfig};
use media_review_backend::routes::auth::create_access_token;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tower::ServiceExt;
use uuid::Uuid;

static TEST_POOL: OnceCell<Option<Arc<PgPool>>> = OnceCell::const_new();

/// Initialize the shared pool and schema once for the whole test binary.
async fn test_pool() -> Option<Arc<PgPool>> {
    TEST_POOL
        .get_or_init(|| async {
            let url = std::env::var("TEST_DATABASE_URL").ok()?;
            let config = DbConfig {
                url,
                ..DbConfig::default()
            };
            let pool = db::init_pool(Some(config)).await.ok()?;
            db::run_migrations(pool.as_ref()).await.ok()?;
            Some(pool)
        })
        .await
        .clone()
}

/// Short unique suffix so tests never collide on unique columns.
fn tag() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

async fn seed_user(pool: &PgPool, role: &str) -> User {
    let username = format!("u{}_{}", tag(), role);
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (username, email, role)
        VALUES ($1, $2, $3)
        RETURNING id, username, email, first_name, last_name, bio, role, is_superuser, created_at
        "#,
    )
    .bind(&username)
    .bind(format!("{}@example.com", username))
    .bind(role)
    .fetch_one(pool)
    .await
    .unwrap()
}

fn token_for(user: &User) -> String {
    create_access_token(user).unwrap()
}

async fn send(
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = create_app().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn rating_is_null_then_rounds_the_mean() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);

    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": format!("Quiet Winters {}", tag()), "year": 2019})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(title["rating"].is_null());
    let title_id = title["id"].as_i64().unwrap();

    let first = seed_user(pool.as_ref(), "user").await;
    let second = seed_user(pool.as_ref(), "user").await;
    let reviews_uri = format!("/api/v1/titles/{}/reviews", title_id);

    let (status, _) = send(
        "POST",
        &reviews_uri,
        Some(&token_for(&first)),
        Some(json!({"text": "slow but moving", "score": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        "POST",
        &reviews_uri,
        Some(&token_for(&second)),
        Some(json!({"text": "stayed with me", "score": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // mean 3.5 rounds away from zero
    let (status, body) = send("GET", &format!("/api/v1/titles/{}", title_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rating"].as_i64(), Some(4));
}

#[tokio::test]
async fn second_review_from_same_author_is_rejected_and_not_stored() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);
    let reviewer = seed_user(pool.as_ref(), "user").await;
    let reviewer_token = token_for(&reviewer);

    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": format!("One Take {}", tag()), "year": 2015})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let title_id = title["id"].as_i64().unwrap();
    let reviews_uri = format!("/api/v1/titles/{}/reviews", title_id);

    let (status, _) = send(
        "POST",
        &reviews_uri,
        Some(&reviewer_token),
        Some(json!({"text": "watched twice", "score": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        "POST",
        &reviews_uri,
        Some(&reviewer_token),
        Some(json!({"text": "changed my mind", "score": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    // Duplicate reviews are a whole-request error, not a field error.
    assert!(body.get("field").is_none());

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reviews WHERE title_id = $1")
        .bind(title_id)
        .fetch_one(pool.as_ref())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn unknown_genre_slug_rejects_the_whole_title() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);

    let slug = format!("noir{}", tag());
    let (status, _) = send(
        "POST",
        "/api/v1/genres",
        Some(&admin_token),
        Some(json!({"name": "Noir", "slug": &slug})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let name = format!("Fanout {}", tag());
    let (status, body) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": &name, "year": 2001, "genre": [&slug, "no-such-genre"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"].as_str(), Some("genre"));

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM titles WHERE name = $1")
        .bind(&name)
        .fetch_one(pool.as_ref())
        .await
        .unwrap();
    assert_eq!(count, 0);

    // The fully-resolvable request lands together with its join rows.
    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": &name, "year": 2001, "genre": [&slug]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(title["genre"].as_array().map(Vec::len), Some(1));
    assert_eq!(title["genre"][0]["slug"].as_str(), Some(slug.as_str()));
}

#[tokio::test]
async fn deleting_a_genre_detaches_it_without_deleting_titles() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);

    let kept = format!("kept{}", tag());
    let dropped = format!("dropped{}", tag());
    for slug in [&kept, &dropped] {
        let (status, _) = send(
            "POST",
            "/api/v1/genres",
            Some(&admin_token),
            Some(json!({"name": "Genre", "slug": slug})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": format!("Two Genres {}", tag()), "year": 1998, "genre": [&kept, &dropped]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let title_id = title["id"].as_i64().unwrap();

    let (status, _) = send(
        "DELETE",
        &format!("/api/v1/genres/{}", dropped),
        Some(&admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send("GET", &format!("/api/v1/titles/{}", title_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let genres = body["genre"].as_array().unwrap();
    assert_eq!(genres.len(), 1);
    assert_eq!(genres[0]["slug"].as_str(), Some(kept.as_str()));
}

#[tokio::test]
async fn deleting_a_category_nulls_title_category() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);

    let slug = format!("films{}", tag());
    let (status, _) = send(
        "POST",
        "/api/v1/categories",
        Some(&admin_token),
        Some(json!({"name": "Films", "slug": &slug})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({"name": format!("Categorized {}", tag()), "year": 2007, "category": &slug})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(title["category"]["slug"].as_str(), Some(slug.as_str()));
    let title_id = title["id"].as_i64().unwrap();

    let (status, _) = send(
        "DELETE",
        &format!("/api/v1/categories/{}", slug),
        Some(&admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send("GET", &format!("/api/v1/titles/{}", title_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["category"].is_null());
}

#[tokio::test]
async fn patch_with_explicit_null_clears_nullable_fields() {
    let Some(pool) = test_pool().await else { return };
    let admin_token = token_for(&seed_user(pool.as_ref(), "admin").await);

    let slug = format!("books{}", tag());
    let (status, _) = send(
        "POST",
        "/api/v1/categories",
        Some(&admin_token),
        Some(json!({"name": "Books", "slug": &slug})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, title) = send(
        "POST",
        "/api/v1/titles",
        Some(&admin_token),
        Some(json!({
            "name": format!("Clearable {}", tag()),
            "year": 2012,
            "description": "first edition",
            "category": &slug
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let title_id = title["id"].as_i64().unwrap();

    let (status, body) = send(
        "PATCH",
        &format!("/api/v1/titles/{}", title_id),
        Some(&admin_token),
        Some(json!({"description": null, "category": null})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["description"].is_null());
    assert!(body["category"].is_null());
}

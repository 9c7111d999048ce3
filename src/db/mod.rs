pub mod models;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tokio::sync::OnceCell;

static DB_POOL: OnceCell<Arc<PgPool>> = OnceCell::const_new();

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/media_review".to_string()),
            max_connections: std::env::var("DB_POOL_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            min_connections: std::env::var("DB_POOL_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        }
    }
}

pub async fn init_pool(config: Option<DbConfig>) -> Result<Arc<PgPool>, sqlx::Error> {
    let config = config.unwrap_or_default();

    tracing::info!("Initializing database connection pool...");
    tracing::debug!(
        "Database URL: {}",
        config.url.replace(
            |c: char| !c.is_ascii_alphanumeric() && c != ':' && c != '/' && c != '@' && c != '.',
            "*"
        )
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(3))
        .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(std::time::Duration::from_secs(1800))
        .test_before_acquire(true)
        .connect(&config.url)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    tracing::info!("Database connection pool initialized successfully");

    let pool = Arc::new(pool);
    let _ = DB_POOL.set(pool.clone());

    Ok(pool)
}

pub fn get_pool() -> Option<Arc<PgPool>> {
    DB_POOL.get().cloned()
}

pub async fn health_check() -> Result<std::time::Duration, sqlx::Error> {
    let pool = get_pool()
        .ok_or_else(|| sqlx::Error::Configuration("Database pool not initialized".into()))?;

    let start = std::time::Instant::now();
    sqlx::query("SELECT 1").fetch_one(pool.as_ref()).await?;

    Ok(start.elapsed())
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            username TEXT UNIQUE NOT NULL,
            email TEXT UNIQUE NOT NULL,
            first_name TEXT,
            last_name TEXT,
            bio TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            is_superuser BOOLEAN NOT NULL DEFAULT false,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_users_username_prefix
            ON users(username text_pattern_ops)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS confirmation_codes (
            user_id UUID PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            code_hash TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT UNIQUE NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS genres (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            slug TEXT UNIQUE NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_categories_name_prefix
            ON categories(name text_pattern_ops);
        CREATE INDEX IF NOT EXISTS idx_genres_name_prefix
            ON genres(name text_pattern_ops)
        "#,
    )
    .execute(pool)
    .await?;

    // Deleting a category must keep the titles that referenced it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS titles (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            year INT NOT NULL,
            description TEXT,
            category_id BIGINT REFERENCES categories(id) ON DELETE SET NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_titles_year ON titles(year);
        CREATE INDEX IF NOT EXISTS idx_titles_category_id ON titles(category_id)
        "#,
    )
    .execute(pool)
    .await?;

    // Genre deletion nulls the join row rather than removing it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS title_genres (
            id BIGSERIAL PRIMARY KEY,
            title_id BIGINT NOT NULL REFERENCES titles(id) ON DELETE CASCADE,
            genre_id BIGINT REFERENCES genres(id) ON DELETE SET NULL,
            UNIQUE (title_id, genre_id)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_title_genres_genre_id ON title_genres(genre_id)
        "#,
    )
    .execute(pool)
    .await?;

    // One review per (title, author); the application re-checks this before
    // inserting, the constraint is the backstop against races.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reviews (
            id BIGSERIAL PRIMARY KEY,
            title_id BIGINT NOT NULL REFERENCES titles(id) ON DELETE CASCADE,
            author_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            score INT NOT NULL CHECK (score BETWEEN 1 AND 10),
            pub_date TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (title_id, author_id)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_reviews_title_id ON reviews(title_id);
        CREATE INDEX IF NOT EXISTS idx_reviews_pub_date ON reviews(pub_date DESC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            id BIGSERIAL PRIMARY KEY,
            review_id BIGINT NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
            author_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            pub_date TIMESTAMPTZ NOT NULL DEFAULT now()
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_comments_review_id ON comments(review_id);
        CREATE INDEX IF NOT EXISTS idx_comments_pub_date ON comments(pub_date DESC)
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");

    Ok(())
}

/// Ensure an operator account exists when ADMIN_USERNAME / ADMIN_EMAIL are
/// configured. Idempotent: re-running promotes the named user to admin.
pub async fn bootstrap_admin(pool: &PgPool) -> Result<(), sqlx::Error> {
    let (username, email) = match (
        std::env::var("ADMIN_USERNAME"),
        std::env::var("ADMIN_EMAIL"),
    ) {
        (Ok(u), Ok(e)) if !u.is_empty() && !e.is_empty() => (u, e),
        _ => return Ok(()),
    };

    sqlx::query(
        r#"
        INSERT INTO users (username, email, role, is_superuser)
        VALUES ($1, $2, 'admin', true)
        ON CONFLICT (username)
            DO UPDATE SET role = 'admin', is_superuser = true
        "#,
    )
    .bind(&username)
    .bind(&email)
    .execute(pool)
    .await?;

    tracing::info!("Admin account ensured for user: {}", username);
    Ok(())
}

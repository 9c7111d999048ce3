//! Database Models - structs representing database tables (used by sqlx/serde).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub role: String,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

/// Title model. The `rating` exposed by the API is never stored here;
/// it is aggregated from reviews at query time (see routes::titles).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Title {
    pub id: i64,
    pub name: String,
    pub year: i32,
    pub description: Option<String>,
    pub category_id: Option<i64>,
}

/// Review model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub title_id: i64,
    pub author_id: Uuid,
    pub text: String,
    pub score: i32,
    pub pub_date: DateTime<Utc>,
}

/// Comment model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub review_id: i64,
    pub author_id: Uuid,
    pub text: String,
    pub pub_date: DateTime<Utc>,
}

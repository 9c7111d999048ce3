/**
 * Routes Module
 * API route handlers and shared request/response plumbing
 */
pub mod auth;
pub mod categories;
pub mod comments;
pub mod genres;
pub mod health;
pub mod permissions;
pub mod reviews;
pub mod titles;
pub mod users;

use axum::http::StatusCode;
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Error response shared by all routes. `field` names the offending
/// request field for validation errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Success response (for delete)
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// The uniform error reply type handlers short-circuit with.
pub type ErrorReply = (StatusCode, Json<ErrorResponse>);

pub fn validation_error(field: &str, message: &str) -> ErrorReply {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            field: Some(field.to_string()),
        }),
    )
}

pub fn bad_request(message: &str) -> ErrorReply {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            field: None,
        }),
    )
}

pub fn not_found() -> ErrorReply {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
            field: None,
        }),
    )
}

pub fn db_unavailable() -> ErrorReply {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "Database not available".to_string(),
            field: None,
        }),
    )
}

/// Log the underlying error and return an opaque 500.
pub fn db_error(context: &str, e: sqlx::Error) -> ErrorReply {
    tracing::error!("Database error {}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Database error".to_string(),
            field: None,
        }),
    )
}

/// Postgres reports constraint violations through the error text; sqlx does
/// not expose the SQLSTATE without downcasting the driver error.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    let msg = e.to_string();
    msg.contains("duplicate key") || msg.contains("unique constraint")
}

// ============================================================================
// Pagination
// ============================================================================

/// Resolve the limit/offset query parameters every list endpoint accepts.
/// Limit defaults to 10 and is clamped to [1, 100]; offset is floored at 0.
pub fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(10).clamp(1, 100), offset.unwrap_or(0).max(0))
}

/// Envelope for paginated list responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct PageResponse<T> {
    pub count: i64,
    pub results: Vec<T>,
}

/// Deserializer for nullable PATCH fields: an absent field stays `None`
/// (keep the stored value), an explicit `null` becomes `Some(None)` (clear
/// it). Pair with `#[serde(default, deserialize_with = "patch_field")]`.
pub fn patch_field<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

// ============================================================================
// Validation
// ============================================================================

lazy_static::lazy_static! {
    /// Slug pattern shared by genres and categories.
    static ref SLUG_REGEX: Regex = Regex::new(r"^[-a-zA-Z0-9_]+$").unwrap();
}

pub fn is_valid_slug(slug: &str) -> bool {
    slug.len() <= 50 && SLUG_REGEX.is_match(slug)
}

pub fn validate_slug(slug: &str) -> Result<(), ErrorReply> {
    if !is_valid_slug(slug) {
        return Err(validation_error(
            "slug",
            "Slug must be at most 50 characters of a-z A-Z 0-9 _ -",
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), ErrorReply> {
    if name.trim().is_empty() {
        return Err(validation_error("name", "Name is required"));
    }
    if name.len() > 256 {
        return Err(validation_error(
            "name",
            "Name must be at most 256 characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_slugs_accepted() {
        assert!(is_valid_slug("drama"));
        assert!(is_valid_slug("sci-fi"));
        assert!(is_valid_slug("noir_1949"));
        assert!(is_valid_slug("UPPER-case"));
    }

    #[test]
    fn test_invalid_slugs_rejected() {
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("with space"));
        assert!(!is_valid_slug("cyrillic-драма"));
        assert!(!is_valid_slug(&"x".repeat(51)));
    }

    #[test]
    fn test_name_length_validated() {
        assert!(validate_name("Westerns").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_page_bounds_defaults_and_clamps() {
        assert_eq!(page_bounds(None, None), (10, 0));
        assert_eq!(page_bounds(Some(1000), Some(-5)), (100, 0));
        assert_eq!(page_bounds(Some(0), Some(20)), (1, 20));
    }
}

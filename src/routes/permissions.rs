/**
 * Authorization predicates
 * Plain boolean functions over the caller's role, evaluated per request
 * against the user row loaded fresh from the database.
 */
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

use crate::db::{self, models::User};
use crate::routes::auth::verify_access_token;
use crate::routes::{db_error, db_unavailable, ErrorReply, ErrorResponse};

/// Authorization tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    /// Parse a stored role string. Unknown values degrade to the lowest tier.
    pub fn parse(s: &str) -> Role {
        match s {
            "admin" => Role::Admin,
            "moderator" => Role::Moderator,
            _ => Role::User,
        }
    }

    /// Whether a client-supplied role value is one of the known tiers.
    pub fn is_known(s: &str) -> bool {
        matches!(s, "user" | "moderator" | "admin")
    }
}

pub fn role_of(user: &User) -> Role {
    Role::parse(&user.role)
}

pub fn is_moderator(user: &User) -> bool {
    role_of(user) == Role::Moderator
}

pub fn is_admin(user: &User) -> bool {
    role_of(user) == Role::Admin || user.is_superuser
}

/// Object-level check for reviews and comments: the author, a moderator
/// or an admin may mutate; everyone else is read-only.
pub fn can_modify_object(user: &User, author_id: Uuid) -> bool {
    user.id == author_id || is_moderator(user) || is_admin(user)
}

fn unauthorized(message: &str) -> ErrorReply {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            field: None,
        }),
    )
}

pub fn forbidden() -> ErrorReply {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse {
            error: "You do not have permission to perform this action".to_string(),
            field: None,
        }),
    )
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Resolve the caller from the Authorization header.
///
/// Token problems are reported before the database is touched, so requests
/// without valid credentials fail 401 even when no pool is configured. The
/// user row is always re-read so role changes take effect immediately.
pub async fn authenticate(headers: &HeaderMap) -> Result<User, ErrorReply> {
    let token =
        extract_bearer_token(headers).ok_or_else(|| unauthorized("Authorization required"))?;

    let claims =
        verify_access_token(&token).map_err(|_| unauthorized("Invalid or expired token"))?;

    let user_id =
        Uuid::parse_str(&claims.sub).map_err(|_| unauthorized("Invalid or expired token"))?;

    let pool = db::get_pool().ok_or_else(db_unavailable)?;

    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, email, first_name, last_name, bio, role, is_superuser, created_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool.as_ref())
    .await
    .map_err(|e| db_error("loading authenticated user", e))?;

    user.ok_or_else(|| unauthorized("User no longer exists"))
}

/// Gate for admin-only endpoints (user management, catalog mutation).
pub fn require_admin(user: &User) -> Result<(), ErrorReply> {
    if is_admin(user) {
        Ok(())
    } else {
        Err(forbidden())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_user(role: &str, is_superuser: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: format!("{}-account", role),
            email: format!("{}@example.com", role),
            first_name: None,
            last_name: None,
            bio: None,
            role: role.to_string(),
            is_superuser,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_role_parse_known_and_unknown() {
        assert_eq!(Role::parse("admin"), Role::Admin);
        assert_eq!(Role::parse("moderator"), Role::Moderator);
        assert_eq!(Role::parse("user"), Role::User);
        assert_eq!(Role::parse("wizard"), Role::User);
    }

    #[test]
    fn test_superuser_counts_as_admin_regardless_of_role() {
        let su = make_user("user", true);
        assert!(is_admin(&su));
        assert!(!is_moderator(&su));
    }

    #[test]
    fn test_plain_user_is_neither_admin_nor_moderator() {
        let user = make_user("user", false);
        assert!(!is_admin(&user));
        assert!(!is_moderator(&user));
    }

    #[test]
    fn test_author_can_modify_own_object() {
        let user = make_user("user", false);
        assert!(can_modify_object(&user, user.id));
        assert!(!can_modify_object(&user, Uuid::new_v4()));
    }

    #[test]
    fn test_moderator_and_admin_can_modify_any_object() {
        let moderator = make_user("moderator", false);
        let admin = make_user("admin", false);
        let other = Uuid::new_v4();
        assert!(can_modify_object(&moderator, other));
        assert!(can_modify_object(&admin, other));
    }

    #[test]
    fn test_require_admin_rejects_lower_tiers() {
        assert!(require_admin(&make_user("admin", false)).is_ok());
        assert!(require_admin(&make_user("moderator", false)).is_err());
        assert!(require_admin(&make_user("user", false)).is_err());
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(
            extract_bearer_token(&headers),
            Some("abc.def.ghi".to_string())
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}

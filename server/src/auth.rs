//! Sessions and password verification.
//!
//! Two session kinds share one table: cookie-bound web sessions and opaque
//! 30-day CLI bearer tokens. Handlers receive the caller through the
//! `CurrentUser` extractor, which checks `Authorization: Bearer` first and
//! falls back to the session cookie.

use crate::error::{AppError, AppResult};
use crate::types::{AppContext, Session, SessionKind, User};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// Web sessions live for a week; CLI tokens for 30 days.
const WEB_SESSION_DAYS: i64 = 7;
const CLI_TOKEN_DAYS: i64 = 30;

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AppError::Processing(format!("password hash: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Opaque 64-hex token; never derived from anything.
fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub async fn create_session(
    db: &SqlitePool,
    user_id: &str,
    kind: SessionKind,
) -> AppResult<Session> {
    let days = match kind {
        SessionKind::Web => WEB_SESSION_DAYS,
        SessionKind::Cli => CLI_TOKEN_DAYS,
    };
    let token = new_token();
    let now = Utc::now();
    let expires_at = now + Duration::days(days);
    sqlx::query(
        "INSERT INTO sessions (token, user_id, kind, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(kind)
    .bind(now)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok(Session { token, user_id: user_id.to_string(), kind, created_at: now, expires_at })
}

pub async fn delete_session(db: &SqlitePool, token: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM sessions WHERE token = ?").bind(token).execute(db).await?;
    Ok(())
}

/// Resolve a token to its user, rejecting unknown and expired sessions.
pub async fn resolve_token(db: &SqlitePool, token: &str) -> AppResult<User> {
    let session: Option<Session> =
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(db)
            .await?;

    let session = session.ok_or_else(|| AppError::Unauthorized("invalid session".into()))?;
    if session.expires_at < Utc::now() {
        delete_session(db, token).await?;
        return Err(AppError::Unauthorized("session expired".into()));
    }
    crate::library::get_user(db, &session.user_id)
        .await
        .map_err(|_| AppError::Unauthorized("invalid session".into()))
}

/// Drop expired sessions. Called periodically from the serve loop.
pub async fn prune_expired(db: &SqlitePool) -> AppResult<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(db)
        .await?;
    let pruned = result.rows_affected();
    if pruned > 0 {
        debug!(pruned, "pruned expired sessions");
    }
    Ok(pruned)
}

// ---------------------------------------------------------------------------
// Login throttling
// ---------------------------------------------------------------------------

const MAX_LOGIN_FAILURES: u32 = 10;
const THROTTLE_WINDOW_SECS: u64 = 15 * 60;

/// Per-username failed-login counter with a sliding window. Lives on the
/// shared context, constructed at startup.
#[derive(Default)]
pub struct LoginThrottle {
    failures: dashmap::DashMap<String, (u32, std::time::Instant)>,
}

impl LoginThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects with `RateLimited` once a username has accumulated too many
    /// failures within the window.
    pub fn check(&self, username: &str) -> AppResult<()> {
        if let Some(entry) = self.failures.get(username) {
            let (count, since) = *entry;
            if since.elapsed().as_secs() < THROTTLE_WINDOW_SECS && count >= MAX_LOGIN_FAILURES {
                return Err(AppError::RateLimited);
            }
        }
        Ok(())
    }

    pub fn record_failure(&self, username: &str) {
        let now = std::time::Instant::now();
        let mut entry = self.failures.entry(username.to_string()).or_insert((0, now));
        if entry.1.elapsed().as_secs() >= THROTTLE_WINDOW_SECS {
            *entry = (0, now);
        }
        entry.0 += 1;
    }

    pub fn record_success(&self, username: &str) {
        self.failures.remove(username);
    }
}

// ---------------------------------------------------------------------------
// Request extraction
// ---------------------------------------------------------------------------

/// Pull a named cookie out of the `Cookie` header.
pub fn cookie_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    let raw = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extractor placing the authenticated caller into a handler argument.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppContext> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .map(str::to_string)
            .or_else(|| cookie_value(parts, &ctx.config.session_cookie).map(str::to_string))
            .ok_or_else(|| AppError::Unauthorized("authentication required".into()))?;

        let user = resolve_token(&ctx.db, &token).await?;
        // Logout needs the presented token, not just the user.
        parts.extensions.insert(SessionToken(token));
        Ok(CurrentUser(user))
    }
}

/// The token the current request authenticated with.
#[derive(Clone)]
pub struct SessionToken(pub String);

/// Extractor variant that additionally requires the admin flag.
pub struct AdminUser(pub User);

impl FromRequestParts<AppContext> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, ctx).await?;
        if !user.is_admin {
            return Err(AppError::Forbidden("admin privileges required".into()));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn tokens_are_opaque_and_distinct() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn throttle_trips_after_repeated_failures() {
        let throttle = LoginThrottle::new();
        for _ in 0..MAX_LOGIN_FAILURES {
            assert!(throttle.check("eve").is_ok());
            throttle.record_failure("eve");
        }
        assert!(matches!(throttle.check("eve"), Err(AppError::RateLimited)));
        // Other usernames are unaffected; success clears the counter.
        assert!(throttle.check("alice").is_ok());
        throttle.record_success("eve");
        assert!(throttle.check("eve").is_ok());
    }
}

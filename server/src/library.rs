//! User and library services.
//!
//! Users own libraries; a library owns its pages, files, and workspaces.
//! Creating either touches both the database and the content store, in that
//! order for users (row first, then tree) and tree-first for archives so a
//! failed move never leaves a dangling row.

use crate::auth;
use crate::error::{AppError, AppResult};
use crate::slug;
use crate::store::ContentStore;
use crate::types::{new_id, Library, User, DEFAULT_QUOTA_BYTES};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn create_user(
    db: &SqlitePool,
    store: &ContentStore,
    username: &str,
    password: &str,
    storage_quota: Option<i64>,
    is_admin: bool,
) -> AppResult<User> {
    slug::validate_username(username)?;
    if password.len() < 8 {
        return Err(AppError::validation_field("password", "must be at least 8 characters"));
    }
    let quota = storage_quota.unwrap_or(DEFAULT_QUOTA_BYTES);
    if quota <= 0 {
        return Err(AppError::validation_field("storageQuota", "must be positive"));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(db)
        .await?;
    if existing.is_some() {
        return Err(AppError::conflict(format!("username '{username}' already exists")));
    }

    let id = new_id();
    let password_hash = auth::hash_password(password)?;
    sqlx::query(
        r#"
        INSERT INTO users (id, username, password_hash, is_admin, storage_quota, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(username)
    .bind(&password_hash)
    .bind(is_admin)
    .bind(quota)
    .bind(Utc::now())
    .execute(db)
    .await?;

    store.create_user_tree(username, quota)?;
    info!(user = username, admin = is_admin, "user created");
    get_user(db, &id).await
}

pub async fn get_user(db: &SqlitePool, user_id: &str) -> AppResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found("user"))
}

pub async fn get_user_by_name(db: &SqlitePool, username: &str) -> AppResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found("user"))
}

pub async fn list_users(db: &SqlitePool) -> AppResult<Vec<User>> {
    let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY username")
        .fetch_all(db)
        .await?;
    Ok(users)
}

/// Archive-then-delete: the on-disk tree moves under `.archived/` before the
/// row (and everything cascading from it) goes away.
pub async fn delete_user(db: &SqlitePool, store: &ContentStore, username: &str) -> AppResult<()> {
    let user = get_user_by_name(db, username).await?;
    if store.user_dir(username).exists() {
        store.archive_user_tree(username)?;
    }
    sqlx::query("DELETE FROM users WHERE id = ?").bind(&user.id).execute(db).await?;
    info!(user = username, "user archived and deleted");
    Ok(())
}

pub async fn reset_password(db: &SqlitePool, username: &str, password: &str) -> AppResult<()> {
    if password.len() < 8 {
        return Err(AppError::validation_field("password", "must be at least 8 characters"));
    }
    let user = get_user_by_name(db, username).await?;
    let hash = auth::hash_password(password)?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(&hash)
        .bind(&user.id)
        .execute(db)
        .await?;
    // Password change invalidates every open session.
    sqlx::query("DELETE FROM sessions WHERE user_id = ?").bind(&user.id).execute(db).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Storage quota (derived, never cached)
// ---------------------------------------------------------------------------

/// Bytes attributable to a user: uploaded file sizes plus page content
/// bytes, over live rows only. Eventual consistency after soft-deletes is
/// accepted.
pub async fn storage_used(db: &SqlitePool, user_id: &str) -> AppResult<i64> {
    let (files,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(f.size), 0) FROM files f
        JOIN libraries l ON l.id = f.library_id
        WHERE l.user_id = ? AND f.deleted_at IS NULL
        "#,
    )
    .bind(user_id)
    .fetch_one(db)
    .await?;

    let (pages,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(length(CAST(p.content AS BLOB))), 0) FROM pages p
        JOIN libraries l ON l.id = p.library_id
        WHERE l.user_id = ? AND p.deleted_at IS NULL
        "#,
    )
    .bind(user_id)
    .fetch_one(db)
    .await?;

    Ok(files + pages)
}

/// Fail with `QuotaExceeded` when `additional` bytes would overflow the
/// user's quota.
pub async fn check_quota(db: &SqlitePool, user: &User, additional: i64) -> AppResult<()> {
    let used = storage_used(db, &user.id).await?;
    if used + additional > user.storage_quota {
        return Err(AppError::QuotaExceeded(user.username.clone()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Libraries
// ---------------------------------------------------------------------------

pub async fn create_library(
    db: &SqlitePool,
    store: &ContentStore,
    user: &User,
    name: &str,
) -> AppResult<Library> {
    let slug = slug::sanitize(name)?;

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM libraries WHERE user_id = ? AND slug = ? AND deleted_at IS NULL",
    )
    .bind(&user.id)
    .bind(&slug)
    .fetch_optional(db)
    .await?;
    if existing.is_some() {
        return Err(AppError::conflict(format!("library '{slug}' already exists")));
    }

    let id = new_id();
    let folder_path =
        store.library_dir(&user.username, &slug).to_string_lossy().to_string();
    sqlx::query(
        r#"
        INSERT INTO libraries (id, user_id, name, slug, folder_path, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(name.trim())
    .bind(&slug)
    .bind(&folder_path)
    .bind(Utc::now())
    .execute(db)
    .await?;

    store.create_library_tree(&user.username, &slug, name.trim())?;
    info!(user = %user.username, library = %slug, "library created");
    get_library(db, &user.id, &id).await
}

/// Fetch a library filtered by owner — a miss and an ownership mismatch are
/// indistinguishable on purpose.
pub async fn get_library(db: &SqlitePool, user_id: &str, library_id: &str) -> AppResult<Library> {
    sqlx::query_as::<_, Library>(
        "SELECT * FROM libraries WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
    )
    .bind(library_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| AppError::not_found("library"))
}

pub async fn list_libraries(db: &SqlitePool, user_id: &str) -> AppResult<Vec<Library>> {
    let libraries = sqlx::query_as::<_, Library>(
        "SELECT * FROM libraries WHERE user_id = ? AND deleted_at IS NULL ORDER BY name",
    )
    .bind(user_id)
    .fetch_all(db)
    .await?;
    Ok(libraries)
}

/// Rename a library: new display name, new slug, folder moved on disk.
/// Conflicts when the new slug collides with another live library.
pub async fn rename_library(
    db: &SqlitePool,
    store: &ContentStore,
    user: &User,
    library_id: &str,
    new_name: &str,
) -> AppResult<Library> {
    let library = get_library(db, &user.id, library_id).await?;
    let new_slug = slug::sanitize(new_name)?;

    if new_slug != library.slug {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM libraries WHERE user_id = ? AND slug = ? AND deleted_at IS NULL",
        )
        .bind(&user.id)
        .bind(&new_slug)
        .fetch_optional(db)
        .await?;
        if existing.is_some() {
            return Err(AppError::conflict(format!("library '{new_slug}' already exists")));
        }

        let old_dir = store.library_dir(&user.username, &library.slug);
        let new_dir = store.library_dir(&user.username, &new_slug);
        std::fs::rename(&old_dir, &new_dir).map_err(|e| AppError::storage(&old_dir, &e))?;
    }

    let folder_path = store.library_dir(&user.username, &new_slug).to_string_lossy().to_string();
    sqlx::query("UPDATE libraries SET name = ?, slug = ?, folder_path = ? WHERE id = ?")
        .bind(new_name.trim())
        .bind(&new_slug)
        .bind(&folder_path)
        .bind(&library.id)
        .execute(db)
        .await?;
    info!(user = %user.username, from = %library.slug, to = %new_slug, "library renamed");
    get_library(db, &user.id, library_id).await
}

/// Soft-delete: the row is marked, the folder moves under the archive root.
pub async fn delete_library(
    db: &SqlitePool,
    store: &ContentStore,
    user: &User,
    library_id: &str,
) -> AppResult<()> {
    let library = get_library(db, &user.id, library_id).await?;
    if store.library_dir(&user.username, &library.slug).exists() {
        store.archive_library_tree(&user.username, &library.slug)?;
    }
    sqlx::query("UPDATE libraries SET deleted_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&library.id)
        .execute(db)
        .await?;
    info!(user = %user.username, library = %library.slug, "library soft-deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Library statistics
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryStats {
    pub pages: i64,
    pub files: i64,
    pub workspaces: i64,
    pub total_words: i64,
    pub links: crate::links::LinkStats,
}

pub async fn library_stats(db: &SqlitePool, library_id: &str) -> AppResult<LibraryStats> {
    let (pages, total_words): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(word_count), 0)
         FROM pages WHERE library_id = ? AND deleted_at IS NULL",
    )
    .bind(library_id)
    .fetch_one(db)
    .await?;
    let (files,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM files WHERE library_id = ? AND deleted_at IS NULL",
    )
    .bind(library_id)
    .fetch_one(db)
    .await?;
    let (workspaces,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM workspaces WHERE library_id = ?")
            .bind(library_id)
            .fetch_one(db)
            .await?;
    let links = crate::links::library_link_stats(db, library_id).await?;

    Ok(LibraryStats { pages, files, workspaces, total_words, links })
}

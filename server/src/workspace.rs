//! Workspace engine: ordered mixed-kind sequences of page/file references.
//!
//! Position scheme: dense unified positions. Within a workspace the
//! `position` column forms the contiguous run 0..n-1 across both kinds, with
//! no duplicates and no gaps — at all times, under arbitrary interleavings.
//!
//! Every position-changing operation runs inside `BEGIN IMMEDIATE` so the
//! SQLite write lock acts as the per-workspace critical section: the
//! pre-shift snapshot seen by one insert is never visible to a later one.

use crate::error::{AppError, AppResult};
use crate::types::{new_id, ItemKind, Workspace, WorkspaceEntry, WorkspaceItem};
use chrono::Utc;
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use tracing::debug;

// ---------------------------------------------------------------------------
// Immediate-transaction helper
// ---------------------------------------------------------------------------

/// Take the write lock up front. A deferred transaction would read the item
/// count from a stale snapshot and fail on lock upgrade under contention.
async fn begin_immediate(db: &SqlitePool) -> AppResult<PoolConnection<Sqlite>> {
    let mut conn = db.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

async fn commit(conn: &mut PoolConnection<Sqlite>) -> AppResult<()> {
    sqlx::query("COMMIT").execute(&mut **conn).await?;
    Ok(())
}

async fn rollback(conn: &mut PoolConnection<Sqlite>) {
    let _ = sqlx::query("ROLLBACK").execute(&mut **conn).await;
}

/// Run `op` inside an immediate transaction with rollback on error.
macro_rules! in_tx {
    ($db:expr, $conn:ident, $body:block) => {{
        let mut $conn = begin_immediate($db).await?;
        let result: AppResult<_> = async { $body }.await;
        match result {
            Ok(value) => {
                commit(&mut $conn).await?;
                Ok(value)
            }
            Err(e) => {
                rollback(&mut $conn).await;
                Err(e)
            }
        }
    }};
}

// ---------------------------------------------------------------------------
// Workspace CRUD
// ---------------------------------------------------------------------------

pub async fn create_workspace(
    db: &SqlitePool,
    library_id: &str,
    title: &str,
) -> AppResult<Workspace> {
    if title.trim().is_empty() {
        return Err(AppError::validation_field("title", "must not be empty"));
    }
    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO workspaces (id, library_id, title, is_favorited, created_at, updated_at)
        VALUES (?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(library_id)
    .bind(title.trim())
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    get_workspace(db, &id).await
}

pub async fn get_workspace(db: &SqlitePool, workspace_id: &str) -> AppResult<Workspace> {
    sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = ?")
        .bind(workspace_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found("workspace"))
}

pub async fn list_workspaces(db: &SqlitePool, library_id: &str) -> AppResult<Vec<Workspace>> {
    let rows = sqlx::query_as::<_, Workspace>(
        "SELECT * FROM workspaces WHERE library_id = ? ORDER BY is_favorited DESC, title",
    )
    .bind(library_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub async fn rename_workspace(
    db: &SqlitePool,
    workspace_id: &str,
    title: &str,
) -> AppResult<Workspace> {
    if title.trim().is_empty() {
        return Err(AppError::validation_field("title", "must not be empty"));
    }
    sqlx::query("UPDATE workspaces SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title.trim())
        .bind(Utc::now())
        .bind(workspace_id)
        .execute(db)
        .await?;
    get_workspace(db, workspace_id).await
}

pub async fn set_favorited(
    db: &SqlitePool,
    workspace_id: &str,
    favorited: bool,
) -> AppResult<Workspace> {
    sqlx::query("UPDATE workspaces SET is_favorited = ?, updated_at = ? WHERE id = ?")
        .bind(favorited)
        .bind(Utc::now())
        .bind(workspace_id)
        .execute(db)
        .await?;
    get_workspace(db, workspace_id).await
}

pub async fn touch_last_accessed(db: &SqlitePool, workspace_id: &str) -> AppResult<()> {
    sqlx::query("UPDATE workspaces SET last_accessed_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(workspace_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Deleting a workspace deletes only the membership edges, never the
/// referenced pages or files.
pub async fn delete_workspace(db: &SqlitePool, workspace_id: &str) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
        .bind(workspace_id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("workspace"));
    }
    sqlx::query("DELETE FROM workspace_items WHERE workspace_id = ?")
        .bind(workspace_id)
        .execute(db)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Item operations
// ---------------------------------------------------------------------------

async fn item_count(
    conn: &mut PoolConnection<Sqlite>,
    workspace_id: &str,
) -> AppResult<i64> {
    let (n,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM workspace_items WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_one(&mut **conn)
            .await?;
    Ok(n)
}

async fn fetch_item(
    conn: &mut PoolConnection<Sqlite>,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
) -> AppResult<Option<WorkspaceItem>> {
    let row = sqlx::query_as::<_, WorkspaceItem>(
        "SELECT * FROM workspace_items WHERE workspace_id = ? AND item_id = ? AND item_kind = ?",
    )
    .bind(workspace_id)
    .bind(item_id)
    .bind(kind)
    .fetch_optional(&mut **conn)
    .await?;
    Ok(row)
}

/// The referenced page/file must exist and belong to a library of the same
/// user that owns the workspace's library. Cross-library references within
/// one user are fine.
async fn check_item_ownership(
    conn: &mut PoolConnection<Sqlite>,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
) -> AppResult<()> {
    let (workspace_owner,): (String,) = sqlx::query_as(
        r#"
        SELECT l.user_id FROM workspaces w
        JOIN libraries l ON l.id = w.library_id
        WHERE w.id = ?
        "#,
    )
    .bind(workspace_id)
    .fetch_optional(&mut **conn)
    .await?
    .ok_or_else(|| AppError::not_found("workspace"))?;

    let sql = match kind {
        ItemKind::Page => {
            r#"
            SELECT l.user_id FROM pages p
            JOIN libraries l ON l.id = p.library_id
            WHERE p.id = ? AND p.deleted_at IS NULL
            "#
        }
        ItemKind::File => {
            r#"
            SELECT l.user_id FROM files f
            JOIN libraries l ON l.id = f.library_id
            WHERE f.id = ? AND f.deleted_at IS NULL
            "#
        }
    };
    let item_owner: Option<(String,)> =
        sqlx::query_as(sql).bind(item_id).fetch_optional(&mut **conn).await?;

    match item_owner {
        None => Err(AppError::not_found("item")),
        Some((owner,)) if owner != workspace_owner => {
            Err(AppError::Forbidden("item belongs to another user".to_string()))
        }
        Some(_) => Ok(()),
    }
}

/// Insert a reference at `pos` (append when omitted or ≥ n), shifting the
/// tail up by one. Duplicate membership is a conflict.
pub async fn add_item(
    db: &SqlitePool,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
    pos: Option<i64>,
    depth: Option<i64>,
) -> AppResult<WorkspaceItem> {
    let depth = depth.unwrap_or(0);
    if depth < 0 {
        return Err(AppError::validation_field("depth", "must be non-negative"));
    }
    if let Some(p) = pos {
        if p < 0 {
            return Err(AppError::validation_field("position", "must be non-negative"));
        }
    }

    in_tx!(db, conn, {
        check_item_ownership(&mut conn, workspace_id, item_id, kind).await?;

        if fetch_item(&mut conn, workspace_id, item_id, kind).await?.is_some() {
            return Err(AppError::conflict("item already present in workspace"));
        }

        let n = item_count(&mut conn, workspace_id).await?;
        let target = pos.map_or(n, |p| p.min(n));

        if target < n {
            sqlx::query(
                "UPDATE workspace_items SET position = position + 1
                 WHERE workspace_id = ? AND position >= ?",
            )
            .bind(workspace_id)
            .bind(target)
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO workspace_items
                (workspace_id, item_id, item_kind, position, depth,
                 is_in_ai_context, is_collapsed, added_at)
            VALUES (?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(workspace_id)
        .bind(item_id)
        .bind(kind)
        .bind(target)
        .bind(depth)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        debug!(workspace = workspace_id, item = item_id, position = target, "item added");
        fetch_item(&mut conn, workspace_id, item_id, kind)
            .await?
            .ok_or_else(|| AppError::not_found("item"))
    })
}

/// Remove at the old position, then insert at the clamped new one. A move to
/// the current position is a no-op (the depth update still applies).
pub async fn move_item(
    db: &SqlitePool,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
    new_pos: i64,
    new_depth: Option<i64>,
) -> AppResult<WorkspaceItem> {
    if let Some(d) = new_depth {
        if d < 0 {
            return Err(AppError::validation_field("depth", "must be non-negative"));
        }
    }

    in_tx!(db, conn, {
        let item = fetch_item(&mut conn, workspace_id, item_id, kind)
            .await?
            .ok_or_else(|| AppError::not_found("item"))?;

        let n = item_count(&mut conn, workspace_id).await?;
        let target = new_pos.clamp(0, n - 1);
        let old = item.position;

        if target != old {
            if target < old {
                sqlx::query(
                    "UPDATE workspace_items SET position = position + 1
                     WHERE workspace_id = ? AND position >= ? AND position < ?
                       AND NOT (item_id = ? AND item_kind = ?)",
                )
                .bind(workspace_id)
                .bind(target)
                .bind(old)
                .bind(item_id)
                .bind(kind)
                .execute(&mut *conn)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE workspace_items SET position = position - 1
                     WHERE workspace_id = ? AND position > ? AND position <= ?
                       AND NOT (item_id = ? AND item_kind = ?)",
                )
                .bind(workspace_id)
                .bind(old)
                .bind(target)
                .bind(item_id)
                .bind(kind)
                .execute(&mut *conn)
                .await?;
            }
        }

        sqlx::query(
            "UPDATE workspace_items SET position = ?, depth = COALESCE(?, depth)
             WHERE workspace_id = ? AND item_id = ? AND item_kind = ?",
        )
        .bind(target)
        .bind(new_depth)
        .bind(workspace_id)
        .bind(item_id)
        .bind(kind)
        .execute(&mut *conn)
        .await?;

        fetch_item(&mut conn, workspace_id, item_id, kind)
            .await?
            .ok_or_else(|| AppError::not_found("item"))
    })
}

/// Delete and close the gap. Returns false when the item was not present.
pub async fn remove_item(
    db: &SqlitePool,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
) -> AppResult<bool> {
    in_tx!(db, conn, {
        let Some(item) = fetch_item(&mut conn, workspace_id, item_id, kind).await? else {
            return Ok(false);
        };

        sqlx::query(
            "DELETE FROM workspace_items
             WHERE workspace_id = ? AND item_id = ? AND item_kind = ?",
        )
        .bind(workspace_id)
        .bind(item_id)
        .bind(kind)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "UPDATE workspace_items SET position = position - 1
             WHERE workspace_id = ? AND position > ?",
        )
        .bind(workspace_id)
        .bind(item.position)
        .execute(&mut *conn)
        .await?;

        Ok(true)
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdate {
    pub depth: Option<i64>,
    pub is_in_ai_context: Option<bool>,
    pub is_collapsed: Option<bool>,
}

/// Field-level flag update. `is_in_ai_context` is ignored for files.
pub async fn update_flags(
    db: &SqlitePool,
    workspace_id: &str,
    item_id: &str,
    kind: ItemKind,
    update: FlagUpdate,
) -> AppResult<WorkspaceItem> {
    if let Some(d) = update.depth {
        if d < 0 {
            return Err(AppError::validation_field("depth", "must be non-negative"));
        }
    }
    let ai_context = match kind {
        ItemKind::Page => update.is_in_ai_context,
        ItemKind::File => None,
    };

    in_tx!(db, conn, {
        if fetch_item(&mut conn, workspace_id, item_id, kind).await?.is_none() {
            return Err(AppError::not_found("item"));
        }

        sqlx::query(
            "UPDATE workspace_items
             SET depth = COALESCE(?, depth),
                 is_in_ai_context = COALESCE(?, is_in_ai_context),
                 is_collapsed = COALESCE(?, is_collapsed)
             WHERE workspace_id = ? AND item_id = ? AND item_kind = ?",
        )
        .bind(update.depth)
        .bind(ai_context)
        .bind(update.is_collapsed)
        .bind(workspace_id)
        .bind(item_id)
        .bind(kind)
        .execute(&mut *conn)
        .await?;

        fetch_item(&mut conn, workspace_id, item_id, kind)
            .await?
            .ok_or_else(|| AppError::not_found("item"))
    })
}

/// The combined sequence in position order, each entry joined with the
/// underlying page/file summary (via `workspace_items_view`).
pub async fn list_items(db: &SqlitePool, workspace_id: &str) -> AppResult<Vec<WorkspaceEntry>> {
    let rows = sqlx::query_as::<_, WorkspaceEntry>(
        r#"
        SELECT item_id, item_kind, position, depth, is_in_ai_context, is_collapsed,
               title, preview
        FROM workspace_items_view
        WHERE workspace_id = ?
        ORDER BY position
        "#,
    )
    .bind(workspace_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Pages flagged into the AI context, in position order.
pub async fn ai_context_items(
    db: &SqlitePool,
    workspace_id: &str,
) -> AppResult<Vec<WorkspaceEntry>> {
    let rows = sqlx::query_as::<_, WorkspaceEntry>(
        r#"
        SELECT wi.item_id, wi.item_kind, wi.position, wi.depth,
               wi.is_in_ai_context, wi.is_collapsed,
               p.title AS title, p.content_preview AS preview
        FROM workspace_items wi
        JOIN pages p ON p.id = wi.item_id
        WHERE wi.workspace_id = ? AND wi.item_kind = 'page' AND wi.is_in_ai_context = 1
        ORDER BY wi.position
        "#,
    )
    .bind(workspace_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// New workspace in the same library with every membership edge copied
/// verbatim — positions, depths, flags. Pages and files are not cloned.
pub async fn duplicate(
    db: &SqlitePool,
    workspace_id: &str,
    new_title: &str,
) -> AppResult<Workspace> {
    if new_title.trim().is_empty() {
        return Err(AppError::validation_field("title", "must not be empty"));
    }

    in_tx!(db, conn, {
        let source = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = ?")
            .bind(workspace_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::not_found("workspace"))?;

        let id = new_id();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, library_id, title, is_favorited, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&source.library_id)
        .bind(new_title.trim())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workspace_items
                (workspace_id, item_id, item_kind, position, depth,
                 is_in_ai_context, is_collapsed, added_at)
            SELECT ?, item_id, item_kind, position, depth,
                   is_in_ai_context, is_collapsed, ?
            FROM workspace_items WHERE workspace_id = ?
            "#,
        )
        .bind(&id)
        .bind(now)
        .bind(workspace_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await
            .map_err(AppError::from)
    })
}

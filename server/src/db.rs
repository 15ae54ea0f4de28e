//! Database pool construction and schema bootstrap.
//!
//! Migrations are plain statements guarded with `IF NOT EXISTS` so the whole
//! list can be re-run on every startup. SQLite runs in WAL mode with foreign
//! keys enforced; its single-writer lock doubles as the critical section for
//! workspace position arithmetic (see `workspace.rs`).

use crate::error::AppResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Statements executed in order on every startup. All re-runnable.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id              TEXT PRIMARY KEY,
        username        TEXT NOT NULL UNIQUE,
        password_hash   TEXT NOT NULL,
        is_admin        INTEGER NOT NULL DEFAULT 0,
        storage_quota   INTEGER NOT NULL,
        created_at      TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS libraries (
        id              TEXT PRIMARY KEY,
        user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name            TEXT NOT NULL,
        slug            TEXT NOT NULL,
        folder_path     TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        deleted_at      TEXT,
        UNIQUE (user_id, slug)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id                  TEXT PRIMARY KEY,
        library_id          TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
        file_name           TEXT NOT NULL,
        file_type           TEXT NOT NULL CHECK (file_type IN ('pdf','epub','image')),
        mime_type           TEXT,
        size                INTEGER NOT NULL DEFAULT 0,
        file_path           TEXT NOT NULL,
        file_hash           TEXT,
        pdf_page_count      INTEGER,
        pdf_author          TEXT,
        pdf_title           TEXT,
        epub_title          TEXT,
        epub_author         TEXT,
        epub_description    TEXT,
        epub_chapter_count  INTEGER,
        cover_image_path    TEXT,
        image_width         INTEGER,
        image_height        INTEGER,
        content_preview     TEXT,
        processing_status   TEXT NOT NULL DEFAULT 'pending'
                            CHECK (processing_status IN ('pending','complete','failed')),
        processing_error    TEXT,
        uploaded_at         TEXT NOT NULL,
        deleted_at          TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pages (
        id              TEXT PRIMARY KEY,
        library_id      TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
        title           TEXT,
        page_type       TEXT NOT NULL CHECK (page_type IN ('saved','file','unsaved')),
        content         TEXT NOT NULL DEFAULT '',
        content_preview TEXT,
        file_path       TEXT,
        file_id         TEXT REFERENCES files(id) ON DELETE SET NULL,
        workspace_id    TEXT,
        file_hash       TEXT,
        word_count      INTEGER NOT NULL DEFAULT 0,
        tags            TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        deleted_at      TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id               TEXT PRIMARY KEY,
        library_id       TEXT NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
        title            TEXT NOT NULL,
        is_favorited     INTEGER NOT NULL DEFAULT 0,
        last_accessed_at TEXT,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workspace_items (
        workspace_id     TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
        item_id          TEXT NOT NULL,
        item_kind        TEXT NOT NULL CHECK (item_kind IN ('page','file')),
        position         INTEGER NOT NULL CHECK (position >= 0),
        depth            INTEGER NOT NULL DEFAULT 0 CHECK (depth >= 0),
        is_in_ai_context INTEGER NOT NULL DEFAULT 0,
        is_collapsed     INTEGER NOT NULL DEFAULT 0,
        added_at         TEXT NOT NULL,
        PRIMARY KEY (workspace_id, item_id, item_kind)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS page_links (
        source_page_id TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
        target_page_id TEXT REFERENCES pages(id) ON DELETE SET NULL,
        link_text      TEXT NOT NULL,
        position       INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        token      TEXT PRIMARY KEY,
        user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        kind       TEXT NOT NULL CHECK (kind IN ('web','cli')),
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    "#,
    // Merged per-workspace view: membership edges joined with the summary of
    // whichever kind each edge references, in display order.
    r#"
    CREATE VIEW IF NOT EXISTS workspace_items_view AS
    SELECT wi.workspace_id, wi.item_id, wi.item_kind, wi.position, wi.depth,
           wi.is_in_ai_context, wi.is_collapsed, wi.added_at,
           CASE wi.item_kind WHEN 'page' THEN p.title ELSE f.file_name END AS title,
           CASE wi.item_kind WHEN 'page' THEN p.content_preview
                             ELSE f.content_preview END AS preview
    FROM workspace_items wi
    LEFT JOIN pages p ON wi.item_kind = 'page' AND p.id = wi.item_id
    LEFT JOIN files f ON wi.item_kind = 'file' AND f.id = wi.item_id
    "#,
    "CREATE INDEX IF NOT EXISTS idx_libraries_user ON libraries(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_pages_library ON pages(library_id)",
    "CREATE INDEX IF NOT EXISTS idx_pages_title ON pages(library_id, title)",
    "CREATE INDEX IF NOT EXISTS idx_files_library ON files(library_id)",
    "CREATE INDEX IF NOT EXISTS idx_workspaces_library ON workspaces(library_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_position ON workspace_items(workspace_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_links_source ON page_links(source_page_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_links_target ON page_links(target_page_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
];

/// Open the pool and bring the schema up to date.
pub async fn connect(database_url: &str) -> AppResult<SqlitePool> {
    // An in-memory database exists per connection, so it must never fan out
    // across a pool.
    let memory = database_url.contains(":memory:");

    let mut opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !memory {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(if memory { 1 } else { 8 })
        .connect_with(opts)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Run all migrations. Safe to call on every startup.
pub async fn migrate(pool: &SqlitePool) -> AppResult<()> {
    for stmt in MIGRATIONS {
        sqlx::query(stmt).execute(pool).await?;
    }
    info!(statements = MIGRATIONS.len(), "database schema up to date");
    Ok(())
}

/// In-memory database for tests.
pub async fn connect_memory() -> AppResult<SqlitePool> {
    connect("sqlite::memory:").await
}

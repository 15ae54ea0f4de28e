//! Core domain types shared by every subsystem.
//!
//! The database is the source of truth for identity, ordering, and derived
//! metadata; the on-disk tree is the source of truth for content bytes.
//! Row structs here mirror the schema in `db.rs` one to one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Per-file upload ceiling (bytes).
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Maximum files per upload batch.
pub const MAX_UPLOAD_BATCH: usize = 10;

/// Content preview length (chars) stored on Pages and Files.
pub const PREVIEW_CHARS: usize = 300;

/// Default per-user storage quota (bytes).
pub const DEFAULT_QUOTA_BYTES: i64 = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Enumerations (stored as TEXT)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PageType {
    Saved,
    File,
    Unsaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Epub,
    Image,
}

impl FileType {
    /// Dispatch by lowercased extension. `None` means unsupported as a File.
    pub fn from_extension(ext: &str) -> Option<FileType> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "epub" => Some(FileType::Epub),
            "jpg" | "jpeg" | "png" | "gif" | "webp" => Some(FileType::Image),
            _ => None,
        }
    }

    pub fn mime_type(&self, ext: &str) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Epub => "application/epub+zip",
            FileType::Image => match ext.to_ascii_lowercase().as_str() {
                "png" => "image/png",
                "gif" => "image/gif",
                "webp" => "image/webp",
                _ => "image/jpeg",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ItemKind {
    Page,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionKind {
    Web,
    Cli,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub storage_quota: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub folder_path: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub library_id: String,
    /// NULL only while `page_type = unsaved`.
    pub title: Option<String>,
    pub page_type: PageType,
    pub content: String,
    pub content_preview: Option<String>,
    /// Backing file under `pages/`, relative to the library folder.
    pub file_path: Option<String>,
    /// Set when `page_type = file`.
    pub file_id: Option<String>,
    /// Set when `page_type = unsaved`.
    pub workspace_id: Option<String>,
    pub file_hash: Option<String>,
    pub word_count: i64,
    /// JSON array of hashtag-derived tags.
    pub tags: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: String,
    pub library_id: String,
    /// On-disk basename under `files/`.
    pub file_name: String,
    pub file_type: FileType,
    pub mime_type: Option<String>,
    pub size: i64,
    /// Relative to the library folder.
    pub file_path: String,
    pub file_hash: Option<String>,
    pub pdf_page_count: Option<i64>,
    pub pdf_author: Option<String>,
    pub pdf_title: Option<String>,
    pub epub_title: Option<String>,
    pub epub_author: Option<String>,
    pub epub_description: Option<String>,
    pub epub_chapter_count: Option<i64>,
    pub cover_image_path: Option<String>,
    pub image_width: Option<i64>,
    pub image_height: Option<i64>,
    pub content_preview: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub library_id: String,
    pub title: String,
    pub is_favorited: bool,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceItem {
    pub workspace_id: String,
    pub item_id: String,
    pub item_kind: ItemKind,
    pub position: i64,
    pub depth: i64,
    pub is_in_ai_context: bool,
    pub is_collapsed: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PageLink {
    pub source_page_id: String,
    /// NULL marks a broken link.
    pub target_page_id: Option<String>,
    pub link_text: String,
    /// Byte offset of the `[[` in the source body.
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(skip_serializing)]
    pub token: String,
    pub user_id: String,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Joined views
// ---------------------------------------------------------------------------

/// One entry of a workspace's combined sequence, joined with the underlying
/// Page/File summary for display.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEntry {
    pub item_id: String,
    pub item_kind: ItemKind,
    pub position: i64,
    pub depth: i64,
    pub is_in_ai_context: bool,
    pub is_collapsed: bool,
    pub title: Option<String>,
    pub preview: Option<String>,
}

// ---------------------------------------------------------------------------
// Server configuration (environment + flags)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub storage_root: PathBuf,
    pub database_url: String,
    pub upload_tmp: PathBuf,
    pub session_cookie: String,
}

impl ServerConfig {
    /// Resolve configuration from the environment, with flag overrides.
    pub fn from_env(storage_flag: Option<PathBuf>, db_flag: Option<String>) -> Self {
        let storage_root = storage_flag
            .or_else(|| std::env::var("FOLIO_STORAGE_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("storage"));

        let database_url =
            db_flag.or_else(|| std::env::var("FOLIO_DATABASE_URL").ok()).unwrap_or_else(|| {
                format!("sqlite://{}?mode=rwc", storage_root.join("folio.db").display())
            });

        let upload_tmp = std::env::var("FOLIO_UPLOAD_TMP")
            .map(PathBuf::from)
            .unwrap_or_else(|_| storage_root.join(".tmp"));

        let session_cookie =
            std::env::var("FOLIO_SESSION_COOKIE").unwrap_or_else(|_| "folio_session".to_string());

        ServerConfig { storage_root, database_url, upload_tmp, session_cookie }
    }
}

// ---------------------------------------------------------------------------
// Shared request context
// ---------------------------------------------------------------------------

/// Process-wide context constructed once at startup and threaded through
/// every request handler. No ambient singletons.
#[derive(Clone)]
pub struct AppContext {
    pub db: SqlitePool,
    pub store: Arc<crate::store::ContentStore>,
    pub config: Arc<ServerConfig>,
    /// Live generation bridges keyed by page ID.
    pub generations: Arc<DashMap<String, crate::stream::GenerationHandle>>,
    pub login_throttle: Arc<crate::auth::LoginThrottle>,
    pub start_time: Instant,
}

/// Fresh v4 ID in the canonical lowercase-hyphenated form used everywhere.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

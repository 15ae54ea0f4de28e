//! Reconciler: diff the on-disk tree against the database and apply
//! compensating mutations.
//!
//! The filesystem owns content bytes; the database owns identity and
//! metadata. `force_sync` walks one library and makes the rows agree with
//! the bytes: missing rows are created, stale rows are refreshed, orphaned
//! rows are soft-deleted. Per-item failures land in the report and never
//! abort the batch.
//!
//! Matching keys: page-kind entries match rows by basename stripped of its
//! extension; file-kind entries match by full basename. Soft-deleted rows
//! participate in matching so a deleted page is not resurrected while its
//! backing file remains on disk.

use crate::error::{AppError, AppResult};
use crate::process::markdown;
use crate::store::{self, ContentStore, ScanCategory, ScannedEntry};
use crate::types::{new_id, Library, Page, StoredFile, User};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetail {
    pub name: String,
    pub action: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub total_pages: usize,
    pub total_files: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub no_change: usize,
    pub errors: usize,
    pub details: Vec<SyncDetail>,
}

impl SyncReport {
    fn record(&mut self, name: &str, action: &str, message: Option<String>) {
        if action == "failed" {
            self.errors += 1;
        }
        self.details.push(SyncDetail {
            name: name.to_string(),
            action: action.to_string(),
            message,
        });
    }
}

/// Basename stripped of its extension — the matching key for page rows.
fn page_key(name: &str) -> String {
    name.rsplit_once('.').map(|(stem, _)| stem.to_string()).unwrap_or_else(|| name.to_string())
}

/// All rows with a backing path, soft-deleted included, keyed for matching.
async fn backed_pages(db: &SqlitePool, library_id: &str) -> AppResult<HashMap<String, Page>> {
    let rows = sqlx::query_as::<_, Page>(
        "SELECT * FROM pages WHERE library_id = ? AND file_path IS NOT NULL",
    )
    .bind(library_id)
    .fetch_all(db)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|p| {
            let rel = p.file_path.clone()?;
            let base = rel.rsplit('/').next().unwrap_or(&rel).to_string();
            Some((page_key(&base), p))
        })
        .collect())
}

async fn known_files(db: &SqlitePool, library_id: &str) -> AppResult<HashMap<String, StoredFile>> {
    let rows = sqlx::query_as::<_, StoredFile>("SELECT * FROM files WHERE library_id = ?")
        .bind(library_id)
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|f| (f.file_name.clone(), f)).collect())
}

/// Create a saved Page row from a file already on disk.
async fn create_page_from_disk(
    db: &SqlitePool,
    user: &User,
    library: &Library,
    entry: &ScannedEntry,
) -> AppResult<Page> {
    let bytes = fs::read(&entry.abs_path).map_err(|e| AppError::storage(&entry.abs_path, &e))?;
    let processed = markdown::process_text(&entry.abs_path, &bytes)?;

    crate::library::check_quota(db, user, bytes.len() as i64)
        .await
        .map_err(|_| AppError::QuotaExceeded(user.username.clone()))?;

    // The filename stem is the identity key, so it is also the title.
    let title = page_key(&entry.name);
    let collision: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT id FROM pages
        WHERE library_id = ? AND deleted_at IS NULL
          AND title IS NOT NULL AND lower(trim(title)) = lower(?)
        "#,
    )
    .bind(&library.id)
    .bind(&title)
    .fetch_optional(db)
    .await?;
    if collision.is_some() {
        return Err(AppError::conflict(format!("page '{title}' already exists")));
    }

    let tags = if processed.tags.is_empty() {
        None
    } else {
        serde_json::to_string(&processed.tags).ok()
    };
    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO pages
            (id, library_id, title, page_type, content, content_preview, file_path,
             file_hash, word_count, tags, created_at, updated_at)
        VALUES (?, ?, ?, 'saved', ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&library.id)
    .bind(&title)
    .bind(&processed.body)
    .bind(&processed.preview)
    .bind(&entry.rel_path)
    .bind(&entry.hash)
    .bind(processed.word_count as i64)
    .bind(&tags)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    crate::links::reparse_links(db, &library.id, &id, &processed.body).await?;
    crate::pages::get_page(db, &id).await
}

/// Refresh a page row whose backing file changed on disk.
async fn update_page_from_disk(
    db: &SqlitePool,
    library: &Library,
    page: &Page,
    entry: &ScannedEntry,
) -> AppResult<()> {
    let bytes = fs::read(&entry.abs_path).map_err(|e| AppError::storage(&entry.abs_path, &e))?;
    let processed = markdown::process_text(&entry.abs_path, &bytes)?;
    let tags = if processed.tags.is_empty() {
        None
    } else {
        serde_json::to_string(&processed.tags).ok()
    };

    sqlx::query(
        r#"
        UPDATE pages
        SET content = ?, content_preview = ?, file_hash = ?, file_path = ?,
            word_count = ?, tags = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&processed.body)
    .bind(&processed.preview)
    .bind(&entry.hash)
    .bind(&entry.rel_path)
    .bind(processed.word_count as i64)
    .bind(&tags)
    .bind(Utc::now())
    .bind(&page.id)
    .execute(db)
    .await?;

    crate::links::reparse_links(db, &library.id, &page.id, &processed.body).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Full reconcile
// ---------------------------------------------------------------------------

/// Reconcile one library. Idempotent: a second run over an unchanged tree
/// reports `updated = 0`.
pub async fn force_sync(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
) -> AppResult<SyncReport> {
    let entries = content_store.scan_library(&user.username, &library.slug)?;
    let mut pages = backed_pages(db, &library.id).await?;
    let mut files = known_files(db, &library.id).await?;

    let mut report = SyncReport::default();

    for entry in &entries {
        match entry.category {
            ScanCategory::Page => {
                report.total_pages += 1;
                let key = page_key(&entry.name);
                match pages.remove(&key) {
                    None => match create_page_from_disk(db, user, library, entry).await {
                        Ok(_) => {
                            report.created += 1;
                            report.record(&entry.name, "created", None);
                        }
                        Err(e) => report.record(&entry.name, "failed", Some(e.to_string())),
                    },
                    Some(page) if page.deleted_at.is_some() => {
                        // A soft-deleted row keeps its backing file frozen.
                        report.no_change += 1;
                    }
                    Some(page) if page.file_hash.as_deref() != Some(entry.hash.as_str()) => {
                        match update_page_from_disk(db, library, &page, entry).await {
                            Ok(()) => {
                                report.updated += 1;
                                report.record(&entry.name, "updated", None);
                            }
                            Err(e) => report.record(&entry.name, "failed", Some(e.to_string())),
                        }
                    }
                    Some(_) => report.no_change += 1,
                }
            }
            ScanCategory::File => {
                report.total_files += 1;
                match files.remove(&entry.name) {
                    None => {
                        match crate::files::create_file_from_disk(
                            db,
                            content_store,
                            user,
                            library,
                            entry,
                        )
                        .await
                        {
                            Ok(file) => {
                                report.created += 1;
                                report.record(
                                    &entry.name,
                                    "created",
                                    file.processing_error.clone(),
                                );
                            }
                            Err(e) => report.record(&entry.name, "failed", Some(e.to_string())),
                        }
                    }
                    Some(file) if file.deleted_at.is_some() => report.no_change += 1,
                    Some(file) if file.file_hash.as_deref() != Some(entry.hash.as_str()) => {
                        match crate::files::refresh_from_disk(
                            db,
                            content_store,
                            user,
                            library,
                            &file,
                            entry,
                        )
                        .await
                        {
                            Ok(()) => {
                                report.updated += 1;
                                report.record(&entry.name, "updated", None);
                            }
                            Err(e) => report.record(&entry.name, "failed", Some(e.to_string())),
                        }
                    }
                    Some(file) => {
                        report.no_change += 1;
                        // One-time cover backfill for rows predating the column.
                        if file.cover_image_path.is_none() {
                            let _ = crate::files::resolve_cover(
                                db,
                                content_store,
                                user,
                                library,
                                &file,
                            )
                            .await;
                        }
                    }
                }
            }
        }
    }

    // Rows left unmatched lost their backing file: soft-delete the live ones.
    for page in pages.values().filter(|p| p.deleted_at.is_none()) {
        match crate::pages::soft_delete_page(db, &page.id).await {
            Ok(()) => {
                report.removed += 1;
                report.record(page.title.as_deref().unwrap_or(&page.id), "removed", None);
            }
            Err(e) => report.record(&page.id, "failed", Some(e.to_string())),
        }
    }
    for file in files.values().filter(|f| f.deleted_at.is_none()) {
        match crate::files::soft_delete_file(db, &file.id).await {
            Ok(()) => {
                report.removed += 1;
                report.record(&file.file_name, "removed", None);
            }
            Err(e) => report.record(&file.file_name, "failed", Some(e.to_string())),
        }
    }

    info!(
        user = %user.username,
        library = %library.slug,
        created = report.created,
        updated = report.updated,
        removed = report.removed,
        no_change = report.no_change,
        errors = report.errors,
        "force sync complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Single-path reconcile (watcher)
// ---------------------------------------------------------------------------

/// Resolve a watched path to its owning user and library. Paths outside
/// `storage/<user>/libraries/<slug>/{pages,files}/` (covers and dot files
/// included) resolve to `None`.
fn locate(root: &Path, path: &Path) -> Option<(String, String, ScanCategory)> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> =
        rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
    if parts.len() < 5 || parts[1] != "libraries" {
        return None;
    }
    if parts.iter().any(|p| p.starts_with('.')) {
        return None;
    }
    let category = match parts[3].as_str() {
        "pages" => ScanCategory::Page,
        // files/covers/* is derived output, not content
        "files" if parts.get(4).map(String::as_str) != Some("covers") => ScanCategory::File,
        _ => return None,
    };
    Some((parts[0].clone(), parts[2].clone(), category))
}

/// Apply one coalesced watcher event: upsert or remove a single path.
pub async fn sync_path(
    db: &SqlitePool,
    content_store: &ContentStore,
    path: &Path,
    removed: bool,
) -> AppResult<()> {
    let Some((username, slug, category)) = locate(content_store.root(), path) else {
        return Ok(());
    };

    let user = match crate::library::get_user_by_name(db, &username).await {
        Ok(u) => u,
        Err(_) => return Ok(()),
    };
    let library: Option<Library> = sqlx::query_as(
        "SELECT * FROM libraries WHERE user_id = ? AND slug = ? AND deleted_at IS NULL",
    )
    .bind(&user.id)
    .bind(&slug)
    .fetch_optional(db)
    .await?;
    let Some(library) = library else {
        return Ok(());
    };

    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

    if removed || !path.exists() {
        match category {
            ScanCategory::Page => {
                let key = page_key(&name);
                if let Some(page) =
                    backed_pages(db, &library.id).await?.remove(&key).filter(|p| p.deleted_at.is_none())
                {
                    crate::pages::soft_delete_page(db, &page.id).await?;
                    info!(library = %slug, page = %key, "watched page removed");
                }
            }
            ScanCategory::File => {
                if let Some(file) =
                    known_files(db, &library.id).await?.remove(&name).filter(|f| f.deleted_at.is_none())
                {
                    crate::files::soft_delete_file(db, &file.id).await?;
                    info!(library = %slug, file = %name, "watched file removed");
                }
            }
        }
        return Ok(());
    }

    let meta = fs::metadata(path).map_err(|e| AppError::storage(path, &e))?;
    if !meta.is_file() {
        return Ok(());
    }
    let lib_dir = content_store.library_dir(&username, &slug);
    let entry = ScannedEntry {
        name: name.clone(),
        abs_path: path.to_path_buf(),
        rel_path: path.strip_prefix(&lib_dir).unwrap_or(path).to_string_lossy().replace('\\', "/"),
        category,
        size: meta.len(),
        hash: store::hash_file(path)?,
        mtime: meta.modified().ok(),
        ctime: meta.created().ok(),
    };

    match category {
        ScanCategory::Page => {
            let key = page_key(&name);
            match backed_pages(db, &library.id).await?.remove(&key) {
                None => {
                    create_page_from_disk(db, &user, &library, &entry).await?;
                    info!(library = %slug, page = %key, "watched page created");
                }
                Some(page)
                    if page.deleted_at.is_none()
                        && page.file_hash.as_deref() != Some(entry.hash.as_str()) =>
                {
                    update_page_from_disk(db, &library, &page, &entry).await?;
                    info!(library = %slug, page = %key, "watched page updated");
                }
                Some(_) => {}
            }
        }
        ScanCategory::File => {
            match known_files(db, &library.id).await?.remove(&name) {
                None => {
                    crate::files::create_file_from_disk(db, content_store, &user, &library, &entry)
                        .await?;
                    info!(library = %slug, file = %name, "watched file created");
                }
                Some(file)
                    if file.deleted_at.is_none()
                        && file.file_hash.as_deref() != Some(entry.hash.as_str()) =>
                {
                    crate::files::refresh_from_disk(
                        db,
                        content_store,
                        &user,
                        &library,
                        &file,
                        &entry,
                    )
                    .await?;
                    info!(library = %slug, file = %name, "watched file updated");
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

//! File ingestion and lookups.
//!
//! Uploads stage into the temp dir, pass the quota gate, then atomically
//! rename into `files/` before the processor runs. Processor failures never
//! block ingestion — the row is created with `processing_status = failed`
//! and the error preserved.

use crate::error::{AppError, AppResult};
use crate::process::{self, Outcome};
use crate::store::{self, ContentStore, DuplicateMode, ScannedEntry};
use crate::types::{new_id, FileType, Library, ProcessingStatus, StoredFile, User};
use chrono::Utc;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::{info, warn};

fn extension_of(file_name: &str) -> String {
    file_name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default()
}

/// Insert a File row from a processed on-disk file.
#[allow(clippy::too_many_arguments)]
async fn insert_row(
    db: &SqlitePool,
    library: &Library,
    file_name: &str,
    file_type: FileType,
    size: i64,
    hash: &str,
    processed: &process::Processed,
) -> AppResult<StoredFile> {
    let id = new_id();
    let ext = extension_of(file_name);
    let (status, error) = match &processed.outcome {
        Outcome::Complete => (ProcessingStatus::Complete, None),
        Outcome::Failed(msg) => (ProcessingStatus::Failed, Some(msg.clone())),
    };
    let meta = &processed.metadata;

    sqlx::query(
        r#"
        INSERT INTO files
            (id, library_id, file_name, file_type, mime_type, size, file_path, file_hash,
             pdf_page_count, pdf_author, pdf_title,
             epub_title, epub_author, epub_description, epub_chapter_count,
             cover_image_path, image_width, image_height,
             content_preview, processing_status, processing_error, uploaded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&library.id)
    .bind(file_name)
    .bind(file_type)
    .bind(file_type.mime_type(&ext))
    .bind(size)
    .bind(format!("files/{file_name}"))
    .bind(hash)
    .bind(meta.page_count)
    .bind(if file_type == FileType::Pdf { processed.author.as_deref() } else { None })
    .bind(if file_type == FileType::Pdf { Some(processed.title.as_str()) } else { None })
    .bind(if file_type == FileType::Epub { Some(processed.title.as_str()) } else { None })
    .bind(if file_type == FileType::Epub { processed.author.as_deref() } else { None })
    .bind(meta.description.as_deref())
    .bind(meta.chapter_count)
    .bind(meta.cover_path.as_deref())
    .bind(meta.width)
    .bind(meta.height)
    .bind(&processed.preview)
    .bind(status)
    .bind(error)
    .bind(Utc::now())
    .execute(db)
    .await?;

    get_file(db, &id).await
}

/// Ingest uploaded bytes into a library. Returns `None` when the duplicate
/// mode is `skip` and the name is already taken.
pub async fn ingest_upload(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    file_name: &str,
    bytes: &[u8],
    mode: DuplicateMode,
) -> AppResult<Option<StoredFile>> {
    let file_name = sanitize_upload_name(file_name)?;
    let ext = extension_of(&file_name);
    let Some(file_type) = FileType::from_extension(&ext) else {
        return Err(AppError::UnsupportedFileType(ext));
    };
    if bytes.len() as u64 > crate::types::MAX_UPLOAD_BYTES {
        return Err(AppError::validation_field(
            "file",
            format!("exceeds the {} MB per-file limit", crate::types::MAX_UPLOAD_BYTES / (1024 * 1024)),
        ));
    }

    // Quota gate before anything lands under files/.
    crate::library::check_quota(db, user, bytes.len() as i64).await?;

    let staged = content_store.stage_upload(bytes)?;
    let final_name = match content_store.promote_upload(
        &staged,
        &user.username,
        &library.slug,
        &file_name,
        mode,
    ) {
        Ok(Some(name)) => name,
        Ok(None) => return Ok(None),
        Err(e) => {
            content_store.discard_upload(&staged);
            return Err(e);
        }
    };

    // Replacing an existing name retires its old row.
    if mode == DuplicateMode::Replace && final_name == file_name {
        sqlx::query(
            "UPDATE files SET deleted_at = ? WHERE library_id = ? AND file_name = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(&library.id)
        .bind(&file_name)
        .execute(db)
        .await?;
    }

    let abs_path = content_store.files_dir(&user.username, &library.slug).join(&final_name);
    let covers_dir = content_store.covers_dir(&user.username, &library.slug);
    let processed = process::process_file(&abs_path, file_type, &covers_dir);

    let file = insert_row(
        db,
        library,
        &final_name,
        file_type,
        bytes.len() as i64,
        &store::hash_bytes(bytes),
        &processed,
    )
    .await?;

    info!(
        library = %library.slug,
        file = %final_name,
        status = ?file.processing_status,
        "file ingested"
    );
    Ok(Some(file))
}

/// Create a File row for a file that is already on disk (reconciler path).
/// A quota overflow still creates the row, marked failed.
pub async fn create_file_from_disk(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    entry: &ScannedEntry,
) -> AppResult<StoredFile> {
    let ext = extension_of(&entry.name);
    let Some(file_type) = FileType::from_extension(&ext) else {
        return Err(AppError::UnsupportedFileType(ext));
    };

    let quota = crate::library::check_quota(db, user, entry.size as i64).await;
    let covers_dir = content_store.covers_dir(&user.username, &library.slug);

    let processed = match quota {
        Ok(()) => process::process_file(&entry.abs_path, file_type, &covers_dir),
        Err(AppError::QuotaExceeded(who)) => {
            warn!(library = %library.slug, file = %entry.name, "quota exceeded during sync");
            process::Processed {
                title: process::title_from_filename(&entry.abs_path),
                author: None,
                preview: String::new(),
                metadata: process::FileMetadata::default(),
                outcome: Outcome::Failed(format!("storage quota exceeded for {who}")),
            }
        }
        Err(other) => return Err(other),
    };

    insert_row(db, library, &entry.name, file_type, entry.size as i64, &entry.hash, &processed)
        .await
}

/// Refresh hash/preview/metadata of an existing row after on-disk change.
pub async fn refresh_from_disk(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    file: &StoredFile,
    entry: &ScannedEntry,
) -> AppResult<()> {
    let covers_dir = content_store.covers_dir(&user.username, &library.slug);
    let processed = process::process_file(&entry.abs_path, file.file_type, &covers_dir);
    let (status, error) = match &processed.outcome {
        Outcome::Complete => (ProcessingStatus::Complete, None),
        Outcome::Failed(msg) => (ProcessingStatus::Failed, Some(msg.clone())),
    };
    let meta = &processed.metadata;

    sqlx::query(
        r#"
        UPDATE files
        SET size = ?, file_hash = ?, content_preview = ?,
            pdf_page_count = ?, pdf_author = ?, pdf_title = ?,
            epub_title = ?, epub_author = ?, epub_description = ?, epub_chapter_count = ?,
            cover_image_path = COALESCE(?, cover_image_path),
            image_width = ?, image_height = ?,
            processing_status = ?, processing_error = ?
        WHERE id = ?
        "#,
    )
    .bind(entry.size as i64)
    .bind(&entry.hash)
    .bind(&processed.preview)
    .bind(meta.page_count)
    .bind(if file.file_type == FileType::Pdf { processed.author.as_deref() } else { None })
    .bind(if file.file_type == FileType::Pdf { Some(processed.title.as_str()) } else { None })
    .bind(if file.file_type == FileType::Epub { Some(processed.title.as_str()) } else { None })
    .bind(if file.file_type == FileType::Epub { processed.author.as_deref() } else { None })
    .bind(meta.description.as_deref())
    .bind(meta.chapter_count)
    .bind(meta.cover_path.as_deref())
    .bind(meta.width)
    .bind(meta.height)
    .bind(status)
    .bind(error)
    .bind(&file.id)
    .execute(db)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookups and deletion
// ---------------------------------------------------------------------------

pub async fn get_file(db: &SqlitePool, file_id: &str) -> AppResult<StoredFile> {
    sqlx::query_as::<_, StoredFile>("SELECT * FROM files WHERE id = ? AND deleted_at IS NULL")
        .bind(file_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found("file"))
}

/// Fetch a file together with its library, filtered by owner.
pub async fn get_file_checked(
    db: &SqlitePool,
    user_id: &str,
    file_id: &str,
) -> AppResult<(StoredFile, Library)> {
    let file = get_file(db, file_id).await?;
    let library = crate::library::get_library(db, user_id, &file.library_id)
        .await
        .map_err(|_| AppError::not_found("file"))?;
    Ok((file, library))
}

pub async fn list_files(db: &SqlitePool, library_id: &str) -> AppResult<Vec<StoredFile>> {
    let files = sqlx::query_as::<_, StoredFile>(
        "SELECT * FROM files WHERE library_id = ? AND deleted_at IS NULL ORDER BY file_name",
    )
    .bind(library_id)
    .fetch_all(db)
    .await?;
    Ok(files)
}

/// Soft-delete a file row and drop its workspace membership edges.
pub async fn soft_delete_file(db: &SqlitePool, file_id: &str) -> AppResult<()> {
    let result = sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(Utc::now())
        .bind(file_id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("file"));
    }

    let memberships: Vec<(String,)> = sqlx::query_as(
        "SELECT workspace_id FROM workspace_items WHERE item_id = ? AND item_kind = 'file'",
    )
    .bind(file_id)
    .fetch_all(db)
    .await?;
    for (workspace_id,) in memberships {
        crate::workspace::remove_item(db, &workspace_id, file_id, crate::types::ItemKind::File)
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Covers
// ---------------------------------------------------------------------------

/// The `cover_image_path` column is authoritative. The filesystem probe
/// under `files/covers/` runs only when the column is NULL, as a one-time
/// backfill.
pub async fn resolve_cover(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    file: &StoredFile,
) -> AppResult<Option<PathBuf>> {
    if let Some(path) = &file.cover_image_path {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(Some(path));
        }
    }

    let stem = file.file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(&file.file_name);
    let covers = content_store.covers_dir(&user.username, &library.slug);
    for ext in ["jpg", "jpeg", "png", "gif", "webp"] {
        let candidate = covers.join(format!("{stem}_cover.{ext}"));
        if candidate.is_file() {
            sqlx::query("UPDATE files SET cover_image_path = ? WHERE id = ?")
                .bind(candidate.to_string_lossy().to_string())
                .bind(&file.id)
                .execute(db)
                .await?;
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Upload basenames must not escape `files/`.
fn sanitize_upload_name(file_name: &str) -> AppResult<String> {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name).trim();
    if name.is_empty() || name.starts_with('.') || name.contains('\0') {
        return Err(AppError::validation_field("fileName", "invalid file name"));
    }
    Ok(name.to_string())
}

//! Page factories and content operations.
//!
//! Kind invariants (enforced here, not by triggers):
//! - saved:   title required, unique in the library, backing file on disk
//! - file:    title required, `file_id` points at a live File row
//! - unsaved: no title required, `workspace_id` required, no backing file
//!
//! An unsaved page becomes saved exactly when it is given a non-empty title,
//! via `convert_unsaved_to_saved`.

use crate::error::{AppError, AppResult};
use crate::process::markdown;
use crate::store::{self, ContentStore};
use crate::types::{new_id, Library, Page, PageType, User};
use chrono::Utc;
use sqlx::SqlitePool;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

const MAX_TITLE_LEN: usize = 200;

/// Saved-page titles become on-disk basenames, so they must be safe path
/// segments as written.
fn validate_title(title: &str) -> AppResult<&str> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::validation_field("title", "must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::validation_field(
            "title",
            format!("must be at most {MAX_TITLE_LEN} characters"),
        ));
    }
    if title.starts_with('.') || title.contains(['/', '\\', '\0']) {
        return Err(AppError::validation_field("title", "contains invalid characters"));
    }
    Ok(title)
}

/// Case-insensitive title collision check among live pages of a library.
async fn title_in_use(
    db: &SqlitePool,
    library_id: &str,
    title: &str,
    exclude_page: Option<&str>,
) -> AppResult<bool> {
    let existing: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT id FROM pages
        WHERE library_id = ? AND deleted_at IS NULL
          AND title IS NOT NULL AND lower(trim(title)) = lower(?)
          AND (? IS NULL OR id != ?)
        LIMIT 1
        "#,
    )
    .bind(library_id)
    .bind(title)
    .bind(exclude_page)
    .bind(exclude_page)
    .fetch_optional(db)
    .await?;
    Ok(existing.is_some())
}

/// Derived columns shared by every content write.
struct Derived {
    preview: String,
    word_count: i64,
    tags: Option<String>,
}

fn derive_columns(content: &str) -> Derived {
    let (_, body) = markdown::extract_frontmatter(content);
    let word_count = body.split_whitespace().count() as i64;
    let tags = markdown::extract_tags(body);
    Derived {
        preview: crate::process::make_preview(body),
        word_count,
        tags: if tags.is_empty() { None } else { serde_json::to_string(&tags).ok() },
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Create a saved page: backing markdown file under `pages/` plus the row.
pub async fn create_saved(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    title: &str,
    content: &str,
) -> AppResult<Page> {
    let title = validate_title(title)?;
    if title_in_use(db, &library.id, title, None).await? {
        return Err(AppError::conflict(format!("page '{title}' already exists")));
    }
    crate::library::check_quota(db, user, content.len() as i64).await?;

    let rel_path = format!("pages/{title}.md");
    let abs_path = content_store.pages_dir(&user.username, &library.slug).join(format!("{title}.md"));
    fs::write(&abs_path, content).map_err(|e| AppError::storage(&abs_path, &e))?;

    let derived = derive_columns(content);
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
    .bind(title)
    .bind(content)
    .bind(&derived.preview)
    .bind(&rel_path)
    .bind(store::hash_bytes(content.as_bytes()))
    .bind(derived.word_count)
    .bind(&derived.tags)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    crate::links::reparse_links(db, &library.id, &id, content).await?;
    info!(library = %library.slug, title, "saved page created");
    get_page(db, &id).await
}

/// Create an unsaved page: a workspace-bound draft with no backing file.
/// `preview` lets a caller seed `content_preview` (generation parameters).
pub async fn create_unsaved(
    db: &SqlitePool,
    library: &Library,
    workspace_id: &str,
    content: &str,
    preview: Option<String>,
) -> AppResult<Page> {
    let derived = derive_columns(content);
    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO pages
            (id, library_id, page_type, content, content_preview, workspace_id,
             word_count, tags, created_at, updated_at)
        VALUES (?, ?, 'unsaved', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&library.id)
    .bind(content)
    .bind(preview.as_deref().unwrap_or(&derived.preview))
    .bind(workspace_id)
    .bind(derived.word_count)
    .bind(&derived.tags)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    crate::links::reparse_links(db, &library.id, &id, content).await?;
    get_page(db, &id).await
}

/// Create a file-kind page pointing at an existing File row.
pub async fn create_file_page(
    db: &SqlitePool,
    library: &Library,
    file_id: &str,
    title: &str,
) -> AppResult<Page> {
    let title = validate_title(title)?;
    let file: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM files WHERE id = ? AND library_id = ? AND deleted_at IS NULL",
    )
    .bind(file_id)
    .bind(&library.id)
    .fetch_optional(db)
    .await?;
    if file.is_none() {
        return Err(AppError::not_found("file"));
    }

    let id = new_id();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO pages
            (id, library_id, title, page_type, content, file_id, created_at, updated_at)
        VALUES (?, ?, ?, 'file', '', ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&library.id)
    .bind(title)
    .bind(file_id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    get_page(db, &id).await
}

/// The unsaved→saved transition: write the backing file, flip the kind,
/// assign the title, clear the workspace binding. Conflicts on an existing
/// title. The file is removed again if the row update fails.
pub async fn convert_unsaved_to_saved(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    page_id: &str,
    title: &str,
) -> AppResult<Page> {
    let page = get_page(db, page_id).await?;
    if page.library_id != library.id {
        return Err(AppError::not_found("page"));
    }
    if page.page_type != PageType::Unsaved {
        return Err(AppError::validation("page is not an unsaved draft"));
    }
    let title = validate_title(title)?;
    if title_in_use(db, &library.id, title, Some(page_id)).await? {
        return Err(AppError::conflict(format!("page '{title}' already exists")));
    }

    let rel_path = format!("pages/{title}.md");
    let abs_path =
        content_store.pages_dir(&user.username, &library.slug).join(format!("{title}.md"));
    fs::write(&abs_path, &page.content).map_err(|e| AppError::storage(&abs_path, &e))?;

    let update = sqlx::query(
        r#"
        UPDATE pages
        SET page_type = 'saved', title = ?, file_path = ?, file_hash = ?,
            workspace_id = NULL, updated_at = ?
        WHERE id = ? AND page_type = 'unsaved'
        "#,
    )
    .bind(title)
    .bind(&rel_path)
    .bind(store::hash_bytes(page.content.as_bytes()))
    .bind(Utc::now())
    .bind(page_id)
    .execute(db)
    .await;

    match update {
        Ok(result) if result.rows_affected() == 1 => {
            info!(library = %library.slug, title, "unsaved page converted to saved");
            get_page(db, page_id).await
        }
        other => {
            let _ = fs::remove_file(&abs_path);
            other?;
            Err(AppError::conflict("page changed concurrently"))
        }
    }
}

// ---------------------------------------------------------------------------
// Content updates
// ---------------------------------------------------------------------------

/// Replace a page's body. Saved pages also rewrite and rehash the backing
/// file; links are re-parsed against the new content either way.
pub async fn update_content(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    page_id: &str,
    content: &str,
) -> AppResult<Page> {
    let page = get_page(db, page_id).await?;
    if page.library_id != library.id {
        return Err(AppError::not_found("page"));
    }
    if page.page_type == PageType::File {
        return Err(AppError::validation("file-backed pages have no editable body"));
    }

    let grow = content.len() as i64 - page.content.len() as i64;
    if grow > 0 {
        crate::library::check_quota(db, user, grow).await?;
    }

    let mut file_hash = page.file_hash.clone();
    if page.page_type == PageType::Saved {
        let rel = page.file_path.as_deref().unwrap_or_default();
        let abs_path = content_store.library_dir(&user.username, &library.slug).join(rel);
        fs::write(&abs_path, content).map_err(|e| AppError::storage(&abs_path, &e))?;
        file_hash = Some(store::hash_bytes(content.as_bytes()));
    }

    let derived = derive_columns(content);
    sqlx::query(
        r#"
        UPDATE pages
        SET content = ?, content_preview = ?, file_hash = ?, word_count = ?, tags = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(content)
    .bind(&derived.preview)
    .bind(&file_hash)
    .bind(derived.word_count)
    .bind(&derived.tags)
    .bind(Utc::now())
    .bind(page_id)
    .execute(db)
    .await?;

    crate::links::reparse_links(db, &library.id, page_id, content).await?;
    get_page(db, page_id).await
}

/// Set a page's title. Saved pages move their backing file; an unsaved
/// draft converts to saved — giving it a non-empty title IS the
/// unsaved→saved transition, whichever path the title arrives through.
pub async fn rename_page(
    db: &SqlitePool,
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    page_id: &str,
    new_title: &str,
) -> AppResult<Page> {
    let page = get_page(db, page_id).await?;
    if page.library_id != library.id {
        return Err(AppError::not_found("page"));
    }
    if page.page_type == PageType::Unsaved {
        return convert_unsaved_to_saved(db, content_store, user, library, page_id, new_title)
            .await;
    }
    let new_title = validate_title(new_title)?;
    if title_in_use(db, &library.id, new_title, Some(page_id)).await? {
        return Err(AppError::conflict(format!("page '{new_title}' already exists")));
    }

    let mut new_rel = page.file_path.clone();
    if page.page_type == PageType::Saved {
        let old_rel = page.file_path.as_deref().unwrap_or_default();
        let lib_dir = content_store.library_dir(&user.username, &library.slug);
        let old_abs = lib_dir.join(old_rel);
        let rel = format!("pages/{new_title}.md");
        let new_abs = lib_dir.join(format!("pages/{new_title}.md"));
        fs::rename(&old_abs, &new_abs).map_err(|e| AppError::storage(&old_abs, &e))?;
        new_rel = Some(rel);
    }

    sqlx::query("UPDATE pages SET title = ?, file_path = ?, updated_at = ? WHERE id = ?")
        .bind(new_title)
        .bind(&new_rel)
        .bind(Utc::now())
        .bind(page_id)
        .execute(db)
        .await?;
    get_page(db, page_id).await
}

/// Soft-delete: the row is hidden, workspace membership edges are removed
/// (with position compaction), the on-disk bytes stay untouched.
pub async fn soft_delete_page(db: &SqlitePool, page_id: &str) -> AppResult<()> {
    let result = sqlx::query("UPDATE pages SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(Utc::now())
        .bind(page_id)
        .execute(db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("page"));
    }

    let memberships: Vec<(String,)> = sqlx::query_as(
        "SELECT workspace_id FROM workspace_items WHERE item_id = ? AND item_kind = 'page'",
    )
    .bind(page_id)
    .fetch_all(db)
    .await?;
    for (workspace_id,) in memberships {
        crate::workspace::remove_item(db, &workspace_id, page_id, crate::types::ItemKind::Page)
            .await?;
    }
    debug!(page = page_id, "page soft-deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn get_page(db: &SqlitePool, page_id: &str) -> AppResult<Page> {
    sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE id = ? AND deleted_at IS NULL")
        .bind(page_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found("page"))
}

/// Fetch a page together with its library, filtered by owner.
pub async fn get_page_checked(
    db: &SqlitePool,
    user_id: &str,
    page_id: &str,
) -> AppResult<(Page, Library)> {
    let page = get_page(db, page_id).await?;
    let library = crate::library::get_library(db, user_id, &page.library_id)
        .await
        .map_err(|_| AppError::not_found("page"))?;
    Ok((page, library))
}

pub async fn list_pages(db: &SqlitePool, library_id: &str) -> AppResult<Vec<Page>> {
    let pages = sqlx::query_as::<_, Page>(
        "SELECT * FROM pages WHERE library_id = ? AND deleted_at IS NULL ORDER BY title",
    )
    .bind(library_id)
    .fetch_all(db)
    .await?;
    Ok(pages)
}

/// Backing-file abs path for a saved page.
pub fn backing_path(
    content_store: &ContentStore,
    user: &User,
    library: &Library,
    page: &Page,
) -> Option<PathBuf> {
    page.file_path
        .as_deref()
        .map(|rel| content_store.library_dir(&user.username, &library.slug).join(rel))
}

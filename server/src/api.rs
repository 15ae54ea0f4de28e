//! HTTP API handlers.
//!
//! All endpoints are mounted under `/api/*` by the main server. Handlers
//! return `AppResult<Json<T>>`; every failure is rendered by `AppError` as
//! `{ "error": { code, message, timestamp } }`. Resource IDs are UUID v4 in
//! paths — the extractor rejects anything that does not parse.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AdminUser, CurrentUser, SessionToken};
use crate::error::{AppError, AppResult};
use crate::store::DuplicateMode;
use crate::types::*;
use crate::{auth, files, library, links, pages, stream, sync, workspace};

/// Build the full API router.
pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/health", get(api_health))
        // auth
        .route("/api/auth/login", post(api_login))
        .route("/api/auth/logout", post(api_logout))
        .route("/api/auth/whoami", get(api_whoami))
        // admin
        .route("/api/admin/users", get(api_admin_list_users).post(api_admin_create_user))
        .route("/api/admin/users/{username}", axum::routing::delete(api_admin_delete_user))
        .route("/api/admin/users/{username}/password", put(api_admin_reset_password))
        // libraries
        .route("/api/libraries", get(api_list_libraries).post(api_create_library))
        .route(
            "/api/libraries/{id}",
            get(api_get_library).put(api_rename_library).delete(api_delete_library),
        )
        .route("/api/libraries/{id}/sync", post(api_sync_library))
        .route("/api/libraries/{id}/stats", get(api_library_stats))
        // pages
        .route("/api/libraries/{id}/pages", get(api_list_pages).post(api_create_page))
        .route(
            "/api/pages/{id}",
            get(api_get_page).put(api_update_page).delete(api_delete_page),
        )
        .route("/api/pages/{id}/convert", post(api_convert_page))
        .route("/api/pages/{id}/links", get(api_page_links))
        .route("/api/pages/{id}/backlinks", get(api_page_backlinks))
        // files
        .route("/api/libraries/{id}/files", get(api_list_files).post(api_upload_files))
        .route("/api/files/{id}", get(api_get_file).delete(api_delete_file))
        .route("/api/files/{id}/cover", get(api_get_cover))
        // workspaces
        .route(
            "/api/libraries/{id}/workspaces",
            get(api_list_workspaces).post(api_create_workspace),
        )
        .route(
            "/api/workspaces/{id}",
            get(api_get_workspace).put(api_update_workspace).delete(api_delete_workspace),
        )
        .route(
            "/api/workspaces/{id}/items",
            get(api_list_items)
                .post(api_add_item)
                .put(api_move_item)
                .patch(api_update_flags)
                .delete(api_remove_item),
        )
        .route("/api/workspaces/{id}/context", get(api_ai_context))
        .route("/api/workspaces/{id}/duplicate", post(api_duplicate_workspace))
        .route("/api/workspaces/{id}/favorite", post(api_favorite_workspace))
        // generation
        .route("/api/pages/{id}/generation", post(api_start_generation))
        .route("/api/pages/{id}/generation/chunks", post(api_push_chunk))
        .route("/api/pages/{id}/generation/finish", post(api_finish_generation))
        .route("/api/pages/{id}/generation/events", get(api_generation_events))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
    /// Request an opaque 30-day bearer token instead of a cookie session.
    #[serde(default)]
    cli: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

pub async fn api_login(
    State(ctx): State<AppContext>,
    Json(body): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    ctx.login_throttle.check(&body.username)?;

    let user = library::get_user_by_name(&ctx.db, &body.username).await.map_err(|_| {
        ctx.login_throttle.record_failure(&body.username);
        AppError::Unauthorized("invalid credentials".into())
    })?;
    if !auth::verify_password(&body.password, &user.password_hash) {
        ctx.login_throttle.record_failure(&body.username);
        return Err(AppError::Unauthorized("invalid credentials".into()));
    }
    ctx.login_throttle.record_success(&body.username);

    let kind = if body.cli { SessionKind::Cli } else { SessionKind::Web };
    let session = auth::create_session(&ctx.db, &user.id, kind).await?;
    info!(user = %user.username, kind = ?kind, "login");

    let mut headers = HeaderMap::new();
    let mut token = None;
    if body.cli {
        token = Some(session.token);
    } else {
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age=604800",
            ctx.config.session_cookie, session.token
        );
        headers.insert(header::SET_COOKIE, cookie.parse().expect("valid cookie header"));
    }

    Ok((headers, Json(LoginResponse { user, token })))
}

pub async fn api_logout(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Extension(SessionToken(token)): Extension<SessionToken>,
) -> AppResult<impl IntoResponse> {
    auth::delete_session(&ctx.db, &token).await?;
    info!(user = %user.username, "logout");

    let mut headers = HeaderMap::new();
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", ctx.config.session_cookie);
    headers.insert(header::SET_COOKIE, cookie.parse().expect("valid cookie header"));
    Ok((headers, Json(serde_json::json!({ "ok": true }))))
}

pub async fn api_whoami(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<serde_json::Value>> {
    let used = library::storage_used(&ctx.db, &user.id).await?;
    Ok(Json(serde_json::json!({
        "user": user,
        "storageUsed": used,
    })))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    username: String,
    password: String,
    storage_quota: Option<i64>,
    #[serde(default)]
    is_admin: bool,
}

pub async fn api_admin_create_user(
    State(ctx): State<AppContext>,
    AdminUser(_admin): AdminUser,
    Json(body): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = library::create_user(
        &ctx.db,
        &ctx.store,
        &body.username,
        &body.password,
        body.storage_quota,
        body.is_admin,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn api_admin_list_users(
    State(ctx): State<AppContext>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Vec<serde_json::Value>>> {
    let users = library::list_users(&ctx.db).await?;
    let mut out = Vec::with_capacity(users.len());
    for user in users {
        let used = library::storage_used(&ctx.db, &user.id).await?;
        out.push(serde_json::json!({ "user": user, "storageUsed": used }));
    }
    Ok(Json(out))
}

pub async fn api_admin_delete_user(
    State(ctx): State<AppContext>,
    AdminUser(admin): AdminUser,
    Path(username): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    if admin.username == username {
        return Err(AppError::validation("refusing to delete the calling admin"));
    }
    library::delete_user(&ctx.db, &ctx.store, &username).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    password: String,
}

pub async fn api_admin_reset_password(
    State(ctx): State<AppContext>,
    AdminUser(_admin): AdminUser,
    Path(username): Path<String>,
    Json(body): Json<ResetPasswordRequest>,
) -> AppResult<Json<serde_json::Value>> {
    library::reset_password(&ctx.db, &username, &body.password).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Libraries
// ---------------------------------------------------------------------------

pub async fn api_list_libraries(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Library>>> {
    Ok(Json(library::list_libraries(&ctx.db, &user.id).await?))
}

#[derive(Deserialize)]
pub struct CreateLibraryRequest {
    name: String,
}

pub async fn api_create_library(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateLibraryRequest>,
) -> AppResult<(StatusCode, Json<Library>)> {
    let lib = library::create_library(&ctx.db, &ctx.store, &user, &body.name).await?;
    Ok((StatusCode::CREATED, Json(lib)))
}

pub async fn api_get_library(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Library>> {
    Ok(Json(library::get_library(&ctx.db, &user.id, &id.to_string()).await?))
}

#[derive(Deserialize)]
pub struct RenameLibraryRequest {
    name: String,
}

pub async fn api_rename_library(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<RenameLibraryRequest>,
) -> AppResult<Json<Library>> {
    let lib =
        library::rename_library(&ctx.db, &ctx.store, &user, &id.to_string(), &body.name).await?;
    Ok(Json(lib))
}

pub async fn api_delete_library(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    library::delete_library(&ctx.db, &ctx.store, &user, &id.to_string()).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn api_sync_library(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<sync::SyncReport>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    let report = sync::force_sync(&ctx.db, &ctx.store, &user, &lib).await?;
    Ok(Json(report))
}

pub async fn api_library_stats(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<library::LibraryStats>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(library::library_stats(&ctx.db, &lib.id).await?))
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

pub async fn api_list_pages(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Page>>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(pages::list_pages(&ctx.db, &lib.id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePageRequest {
    title: Option<String>,
    #[serde(default)]
    content: String,
    /// Present for unsaved drafts.
    workspace_id: Option<Uuid>,
    /// Present for file-kind pages.
    file_id: Option<Uuid>,
    /// Seeds `content_preview` (generation parameters) on unsaved drafts.
    content_preview: Option<String>,
}

pub async fn api_create_page(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CreatePageRequest>,
) -> AppResult<(StatusCode, Json<Page>)> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;

    let page = match (&body.file_id, &body.workspace_id, &body.title) {
        (Some(file_id), _, Some(title)) => {
            pages::create_file_page(&ctx.db, &lib, &file_id.to_string(), title).await?
        }
        (Some(_), _, None) => {
            return Err(AppError::validation_field("title", "required for file pages"))
        }
        (None, Some(workspace_id), None) => {
            // Workspace must belong to this library.
            let ws = workspace::get_workspace(&ctx.db, &workspace_id.to_string()).await?;
            if ws.library_id != lib.id {
                return Err(AppError::not_found("workspace"));
            }
            pages::create_unsaved(
                &ctx.db,
                &lib,
                &ws.id,
                &body.content,
                body.content_preview.clone(),
            )
            .await?
        }
        (None, _, Some(title)) => {
            pages::create_saved(&ctx.db, &ctx.store, &user, &lib, title, &body.content).await?
        }
        (None, None, None) => {
            return Err(AppError::validation(
                "a page needs a title, or a workspaceId for an unsaved draft",
            ))
        }
    };
    Ok((StatusCode::CREATED, Json(page)))
}

pub async fn api_get_page(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Page>> {
    let (page, _) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
pub struct UpdatePageRequest {
    content: Option<String>,
    title: Option<String>,
}

pub async fn api_update_page(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePageRequest>,
) -> AppResult<Json<Page>> {
    let (page, lib) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;

    let mut result = page;
    if let Some(title) = &body.title {
        result = pages::rename_page(&ctx.db, &ctx.store, &user, &lib, &result.id, title).await?;
    }
    if let Some(content) = &body.content {
        result =
            pages::update_content(&ctx.db, &ctx.store, &user, &lib, &result.id, content).await?;
    }
    Ok(Json(result))
}

pub async fn api_delete_page(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let (page, _) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;
    pages::soft_delete_page(&ctx.db, &page.id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ConvertPageRequest {
    title: String,
}

pub async fn api_convert_page(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<ConvertPageRequest>,
) -> AppResult<Json<Page>> {
    let (page, lib) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;
    let page =
        pages::convert_unsaved_to_saved(&ctx.db, &ctx.store, &user, &lib, &page.id, &body.title)
            .await?;
    Ok(Json(page))
}

pub async fn api_page_links(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let (page, _) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;
    let all = links::all_links(&ctx.db, &page.id).await?;
    let resolved = all.iter().filter(|l| l.target_page_id.is_some()).count();
    Ok(Json(serde_json::json!({
        "linksFound": all.len(),
        "linksResolved": resolved,
        "brokenLinks": all.len() - resolved,
        "details": all,
    })))
}

pub async fn api_page_backlinks(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<links::BacklinkEntry>>> {
    let (page, _) = pages::get_page_checked(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(links::backlinks(&ctx.db, &page.id).await?))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

pub async fn api_list_files(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<StoredFile>>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(files::list_files(&ctx.db, &lib.id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    #[serde(default = "default_duplicate_mode")]
    on_duplicate: DuplicateMode,
}

fn default_duplicate_mode() -> DuplicateMode {
    DuplicateMode::Rename
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    file_name: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<StoredFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Multipart upload: up to 10 files, 100 MB each, with per-item results —
/// a partial failure is never hidden inside a successful response.
pub async fn api_upload_files(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> AppResult<Json<Vec<UploadResult>>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;

    let mut results = Vec::new();
    let mut count = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("malformed multipart body: {e}")))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        count += 1;
        if count > MAX_UPLOAD_BATCH {
            return Err(AppError::validation_field(
                "files",
                format!("at most {MAX_UPLOAD_BATCH} files per batch"),
            ));
        }

        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(e) => {
                results.push(UploadResult {
                    file_name,
                    status: "failed".into(),
                    file: None,
                    error: Some(format!("read error: {e}")),
                });
                continue;
            }
        };

        match files::ingest_upload(
            &ctx.db,
            &ctx.store,
            &user,
            &lib,
            &file_name,
            &bytes,
            query.on_duplicate,
        )
        .await
        {
            Ok(Some(file)) => results.push(UploadResult {
                file_name,
                status: "created".into(),
                file: Some(file),
                error: None,
            }),
            Ok(None) => results.push(UploadResult {
                file_name,
                status: "skipped".into(),
                file: None,
                error: None,
            }),
            Err(e) => results.push(UploadResult {
                file_name,
                status: "failed".into(),
                file: None,
                error: Some(e.to_string()),
            }),
        }
    }

    if results.is_empty() {
        return Err(AppError::validation_field("files", "no files in upload"));
    }
    Ok(Json(results))
}

pub async fn api_get_file(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<StoredFile>> {
    let (file, _) = files::get_file_checked(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(file))
}

pub async fn api_delete_file(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let (file, _) = files::get_file_checked(&ctx.db, &user.id, &id.to_string()).await?;
    files::soft_delete_file(&ctx.db, &file.id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Cover image bytes with a 24-hour cache header.
pub async fn api_get_cover(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (file, lib) = files::get_file_checked(&ctx.db, &user.id, &id.to_string()).await?;
    let cover = files::resolve_cover(&ctx.db, &ctx.store, &user, &lib, &file)
        .await?
        .ok_or_else(|| AppError::not_found("cover"))?;

    let bytes = tokio::fs::read(&cover).await.map_err(|e| AppError::storage(&cover, &e))?;
    let content_type = match cover.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=86400"),
        ],
        bytes,
    ))
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// Fetch a workspace filtered by ownership of its library.
async fn workspace_checked(
    ctx: &AppContext,
    user: &User,
    workspace_id: &str,
) -> AppResult<Workspace> {
    let ws = workspace::get_workspace(&ctx.db, workspace_id).await?;
    library::get_library(&ctx.db, &user.id, &ws.library_id)
        .await
        .map_err(|_| AppError::not_found("workspace"))?;
    Ok(ws)
}

pub async fn api_list_workspaces(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Workspace>>> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    Ok(Json(workspace::list_workspaces(&ctx.db, &lib.id).await?))
}

#[derive(Deserialize)]
pub struct CreateWorkspaceRequest {
    title: String,
}

pub async fn api_create_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateWorkspaceRequest>,
) -> AppResult<(StatusCode, Json<Workspace>)> {
    let lib = library::get_library(&ctx.db, &user.id, &id.to_string()).await?;
    let ws = workspace::create_workspace(&ctx.db, &lib.id, &body.title).await?;
    Ok((StatusCode::CREATED, Json(ws)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDetail {
    #[serde(flatten)]
    workspace: Workspace,
    items: Vec<WorkspaceEntry>,
}

pub async fn api_get_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkspaceDetail>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    workspace::touch_last_accessed(&ctx.db, &ws.id).await?;
    let items = workspace::list_items(&ctx.db, &ws.id).await?;
    Ok(Json(WorkspaceDetail { workspace: ws, items }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkspaceRequest {
    title: Option<String>,
    is_favorited: Option<bool>,
}

pub async fn api_update_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWorkspaceRequest>,
) -> AppResult<Json<Workspace>> {
    let mut ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    if let Some(title) = &body.title {
        ws = workspace::rename_workspace(&ctx.db, &ws.id, title).await?;
    }
    if let Some(favorited) = body.is_favorited {
        ws = workspace::set_favorited(&ctx.db, &ws.id, favorited).await?;
    }
    Ok(Json(ws))
}

pub async fn api_delete_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    workspace::delete_workspace(&ctx.db, &ws.id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn api_list_items(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<WorkspaceEntry>>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    Ok(Json(workspace::list_items(&ctx.db, &ws.id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemRequest {
    item_id: Uuid,
    item_kind: ItemKind,
    position: Option<i64>,
    depth: Option<i64>,
}

pub async fn api_add_item(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<AddItemRequest>,
) -> AppResult<(StatusCode, Json<WorkspaceItem>)> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    let item = workspace::add_item(
        &ctx.db,
        &ws.id,
        &body.item_id.to_string(),
        body.item_kind,
        body.position,
        body.depth,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveItemRequest {
    item_id: Uuid,
    item_kind: ItemKind,
    position: i64,
    depth: Option<i64>,
}

pub async fn api_move_item(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<MoveItemRequest>,
) -> AppResult<Json<WorkspaceItem>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    let item = workspace::move_item(
        &ctx.db,
        &ws.id,
        &body.item_id.to_string(),
        body.item_kind,
        body.position,
        body.depth,
    )
    .await?;
    Ok(Json(item))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveItemQuery {
    item_id: Uuid,
    item_kind: ItemKind,
}

pub async fn api_remove_item(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Query(query): Query<RemoveItemQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    let removed = workspace::remove_item(
        &ctx.db,
        &ws.id,
        &query.item_id.to_string(),
        query.item_kind,
    )
    .await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagsRequest {
    item_id: Uuid,
    item_kind: ItemKind,
    #[serde(flatten)]
    flags: workspace::FlagUpdate,
}

pub async fn api_update_flags(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateFlagsRequest>,
) -> AppResult<Json<WorkspaceItem>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    let item = workspace::update_flags(
        &ctx.db,
        &ws.id,
        &body.item_id.to_string(),
        body.item_kind,
        body.flags,
    )
    .await?;
    Ok(Json(item))
}

pub async fn api_ai_context(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<WorkspaceEntry>>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    Ok(Json(workspace::ai_context_items(&ctx.db, &ws.id).await?))
}

#[derive(Deserialize)]
pub struct DuplicateWorkspaceRequest {
    title: String,
}

pub async fn api_duplicate_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<DuplicateWorkspaceRequest>,
) -> AppResult<(StatusCode, Json<Workspace>)> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    let copy = workspace::duplicate(&ctx.db, &ws.id, &body.title).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteRequest {
    #[serde(default = "default_true")]
    is_favorited: bool,
}

fn default_true() -> bool {
    true
}

pub async fn api_favorite_workspace(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<FavoriteRequest>,
) -> AppResult<Json<Workspace>> {
    let ws = workspace_checked(&ctx, &user, &id.to_string()).await?;
    Ok(Json(workspace::set_favorited(&ctx.db, &ws.id, body.is_favorited).await?))
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Only the page's owner may attach a bridge, and only to an unsaved draft.
async fn generation_page_checked(
    ctx: &AppContext,
    user: &User,
    page_id: &str,
) -> AppResult<Page> {
    let (page, _) = pages::get_page_checked(&ctx.db, &user.id, page_id).await?;
    if page.page_type != PageType::Unsaved {
        return Err(AppError::validation("generation targets an unsaved draft"));
    }
    Ok(page)
}

pub async fn api_start_generation(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let page = generation_page_checked(&ctx, &user, &id.to_string()).await?;
    stream::start_generation(&ctx, &page.id).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "pageId": page.id }))))
}

#[derive(Deserialize)]
pub struct ChunkRequest {
    text: String,
}

pub async fn api_push_chunk(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(body): Json<ChunkRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let page = generation_page_checked(&ctx, &user, &id.to_string()).await?;
    let handle = stream::get_generation(&ctx, &page.id)?;
    handle.push(body.text).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn api_finish_generation(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let page = generation_page_checked(&ctx, &user, &id.to_string()).await?;
    stream::finish_generation(&ctx, &page.id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `text/event-stream` of generation events for a page.
pub async fn api_generation_events(
    State(ctx): State<AppContext>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let page = generation_page_checked(&ctx, &user, &id.to_string()).await?;
    let handle = stream::get_generation(&ctx, &page.id)?;
    let (history, rx) = handle.subscribe();

    fn to_sse(event: &stream::StreamEvent) -> Option<SseEvent> {
        let name = match event {
            stream::StreamEvent::Start => "start",
            stream::StreamEvent::Chunk { .. } => "chunk",
            stream::StreamEvent::Complete { .. } => "complete",
            stream::StreamEvent::Error { .. } => "error",
        };
        SseEvent::default().event(name).json_data(event).ok()
    }

    // Replay everything emitted before this subscriber attached, then live.
    let replay = tokio_stream::iter(
        history.iter().filter_map(to_sse).map(Ok::<_, std::convert::Infallible>).collect::<Vec<_>>(),
    );
    let live = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => to_sse(&event).map(Ok::<_, std::convert::Infallible>),
        // A lagged subscriber just misses events; the stream stays up.
        Err(_) => None,
    });

    Ok(Sse::new(replay.chain(live)).keep_alive(KeepAlive::default()))
}

//! On-disk content store.
//!
//! Owns the storage tree layout and nothing else — identity and metadata
//! live in the database. Layout:
//!
//! ```text
//! storage/
//!   <username>/
//!     .user-config.json
//!     libraries/
//!       <library-slug>/
//!         .library-config.json
//!         pages/
//!         files/
//!           covers/
//!   .archived/
//!     <username>-<epoch-ms>/
//! ```
//!
//! Every I/O failure surfaces as `AppError::Storage` carrying the path.

use crate::error::{AppError, AppResult};
use crate::types::ServerConfig;
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How to resolve a destination collision when promoting an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateMode {
    Skip,
    Replace,
    Rename,
}

/// Category of a scanned entry, by which subtree it was found under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanCategory {
    Page,
    File,
}

/// One regular file discovered by `scan_library`.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Basename including extension.
    pub name: String,
    pub abs_path: PathBuf,
    /// Relative to the library folder (`pages/...` or `files/...`).
    pub rel_path: String,
    pub category: ScanCategory,
    pub size: u64,
    pub hash: String,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserConfigFile {
    username: String,
    created_at: String,
    storage_quota: i64,
    version: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryConfigFile {
    name: String,
    slug: String,
    created_at: String,
    version: String,
}

// ---------------------------------------------------------------------------
// Hasher
// ---------------------------------------------------------------------------

/// SHA-256 of a file's bytes as 64 lowercase hex chars, streamed in 64 KiB reads.
pub fn hash_file(path: &Path) -> AppResult<String> {
    let mut file = fs::File::open(path).map_err(|e| AppError::storage(path, &e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| AppError::storage(path, &e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory buffer (uploads are hashed before promotion).
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ---------------------------------------------------------------------------
// Content store
// ---------------------------------------------------------------------------

pub struct ContentStore {
    root: PathBuf,
    upload_tmp: PathBuf,
}

impl ContentStore {
    pub fn new(config: &ServerConfig) -> AppResult<Self> {
        let store = ContentStore {
            root: config.storage_root.clone(),
            upload_tmp: config.upload_tmp.clone(),
        };
        store.ensure_dir(&store.root)?;
        store.ensure_dir(&store.upload_tmp)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_dir(&self, path: &Path) -> AppResult<()> {
        fs::create_dir_all(path).map_err(|e| AppError::storage(path, &e))
    }

    // -- path helpers ------------------------------------------------------

    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    pub fn libraries_dir(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("libraries")
    }

    pub fn library_dir(&self, username: &str, slug: &str) -> PathBuf {
        self.libraries_dir(username).join(slug)
    }

    pub fn pages_dir(&self, username: &str, slug: &str) -> PathBuf {
        self.library_dir(username, slug).join("pages")
    }

    pub fn files_dir(&self, username: &str, slug: &str) -> PathBuf {
        self.library_dir(username, slug).join("files")
    }

    pub fn covers_dir(&self, username: &str, slug: &str) -> PathBuf {
        self.files_dir(username, slug).join("covers")
    }

    fn archive_root(&self) -> PathBuf {
        self.root.join(".archived")
    }

    // -- tree lifecycle ----------------------------------------------------

    /// Create `storage/<username>/` with its config file and `libraries/`.
    pub fn create_user_tree(&self, username: &str, storage_quota: i64) -> AppResult<()> {
        let dir = self.user_dir(username);
        self.ensure_dir(&self.libraries_dir(username))?;

        let config = UserConfigFile {
            username: username.to_string(),
            created_at: Utc::now().to_rfc3339(),
            storage_quota,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_json_pretty(&dir.join(".user-config.json"), &config)
    }

    /// Create a library folder with `pages/`, `files/`, and `files/covers/`.
    pub fn create_library_tree(&self, username: &str, slug: &str, name: &str) -> AppResult<()> {
        self.ensure_dir(&self.pages_dir(username, slug))?;
        self.ensure_dir(&self.covers_dir(username, slug))?;

        let config = LibraryConfigFile {
            name: name.to_string(),
            slug: slug.to_string(),
            created_at: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_json_pretty(
            &self.library_dir(username, slug).join(".library-config.json"),
            &config,
        )
    }

    /// Move a user's whole tree under `storage/.archived/<name>-<epoch-ms>/`.
    pub fn archive_user_tree(&self, username: &str) -> AppResult<PathBuf> {
        let src = self.user_dir(username);
        let dest = self.archive_root().join(format!("{username}-{}", Utc::now().timestamp_millis()));
        self.ensure_dir(&self.archive_root())?;
        fs::rename(&src, &dest).map_err(|e| AppError::storage(&src, &e))?;
        debug!(user = username, dest = %dest.display(), "archived user tree");
        Ok(dest)
    }

    /// Move a single library folder under the archive root.
    pub fn archive_library_tree(&self, username: &str, slug: &str) -> AppResult<PathBuf> {
        let src = self.library_dir(username, slug);
        let dest = self
            .archive_root()
            .join(format!("{username}-{slug}-{}", Utc::now().timestamp_millis()));
        self.ensure_dir(&self.archive_root())?;
        fs::rename(&src, &dest).map_err(|e| AppError::storage(&src, &e))?;
        debug!(user = username, library = slug, dest = %dest.display(), "archived library tree");
        Ok(dest)
    }

    /// Usernames that have a directory under the storage root.
    pub fn list_user_dirs(&self) -> AppResult<Vec<String>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| AppError::storage(&self.root, &e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && !name.starts_with('.') {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Library slugs present on disk for a user.
    pub fn list_library_dirs(&self, username: &str) -> AppResult<Vec<String>> {
        let dir = self.libraries_dir(username);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| AppError::storage(&dir, &e))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    // -- scanning ----------------------------------------------------------

    /// One record per regular file under `pages/` and `files/`, hashed in
    /// parallel. Cover images under `files/covers/` are derived artifacts
    /// and are not scanned.
    pub fn scan_library(&self, username: &str, slug: &str) -> AppResult<Vec<ScannedEntry>> {
        let lib_dir = self.library_dir(username, slug);
        let covers = self.covers_dir(username, slug);

        let mut candidates: Vec<(PathBuf, ScanCategory)> = Vec::new();
        for (sub, category) in
            [("pages", ScanCategory::Page), ("files", ScanCategory::File)]
        {
            let dir = lib_dir.join(sub);
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.path().starts_with(&covers) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                candidates.push((entry.into_path(), category));
            }
        }

        let entries: Vec<ScannedEntry> = candidates
            .par_iter()
            .filter_map(|(abs_path, category)| {
                let meta = match fs::metadata(abs_path) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %abs_path.display(), error = %e, "skipping unreadable entry");
                        return None;
                    }
                };
                let hash = match hash_file(abs_path) {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(path = %abs_path.display(), error = %e, "skipping unhashable entry");
                        return None;
                    }
                };
                let rel_path = abs_path
                    .strip_prefix(&lib_dir)
                    .unwrap_or(abs_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                Some(ScannedEntry {
                    name: abs_path.file_name().unwrap_or_default().to_string_lossy().to_string(),
                    abs_path: abs_path.clone(),
                    rel_path,
                    category: *category,
                    size: meta.len(),
                    hash,
                    mtime: meta.modified().ok(),
                    ctime: meta.created().ok(),
                })
            })
            .collect();

        Ok(entries)
    }

    // -- uploads -----------------------------------------------------------

    /// Stage upload bytes into the temp dir. The caller promotes or discards.
    pub fn stage_upload(&self, bytes: &[u8]) -> AppResult<PathBuf> {
        self.ensure_dir(&self.upload_tmp)?;
        let tmp = self.upload_tmp.join(format!("upload-{}", crate::types::new_id()));
        fs::write(&tmp, bytes).map_err(|e| AppError::storage(&tmp, &e))?;
        Ok(tmp)
    }

    /// Atomically move a staged upload into `files/`, resolving name
    /// collisions per `mode`. Returns the final basename, or `None` when the
    /// mode is `Skip` and the destination already exists; a skipped staged
    /// file is removed.
    pub fn promote_upload(
        &self,
        staged: &Path,
        username: &str,
        slug: &str,
        file_name: &str,
        mode: DuplicateMode,
    ) -> AppResult<Option<String>> {
        let files_dir = self.files_dir(username, slug);
        self.ensure_dir(&files_dir)?;

        let mut final_name = file_name.to_string();
        let dest = files_dir.join(&final_name);
        if dest.exists() {
            match mode {
                DuplicateMode::Skip => {
                    let _ = fs::remove_file(staged);
                    return Ok(None);
                }
                DuplicateMode::Replace => {}
                DuplicateMode::Rename => {
                    final_name = next_free_name(&files_dir, file_name);
                }
            }
        }

        let dest = files_dir.join(&final_name);
        fs::rename(staged, &dest).map_err(|e| AppError::storage(&dest, &e))?;
        Ok(Some(final_name))
    }

    /// Remove a staged upload without promoting it.
    pub fn discard_upload(&self, staged: &Path) {
        let _ = fs::remove_file(staged);
    }
}

/// Append `_<n>` before the extension until the name is free.
fn next_free_name(dir: &Path, file_name: &str) -> String {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), Some(e.to_string())),
        None => (file_name.to_string(), None),
    };
    for n in 1u32.. {
        let candidate = match &ext {
            Some(e) => format!("{stem}_{n}.{e}"),
            None => format!("{stem}_{n}"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!("u32 exhausted finding a free name")
}

/// Config files are JSON with 2-space indent.
fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Processing(format!("{}: {e}", path.display())))?;
    fs::write(path, json).map_err(|e| AppError::storage(path, &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            storage_root: tmp.path().join("storage"),
            database_url: String::new(),
            upload_tmp: tmp.path().join("storage/.tmp"),
            session_cookie: "folio_session".into(),
        };
        let store = ContentStore::new(&config).unwrap();
        (tmp, store)
    }

    #[test]
    fn user_and_library_trees() {
        let (_tmp, store) = store();
        store.create_user_tree("alice", 1024).unwrap();
        store.create_library_tree("alice", "notes", "Notes").unwrap();

        assert!(store.pages_dir("alice", "notes").is_dir());
        assert!(store.covers_dir("alice", "notes").is_dir());
        assert!(store.user_dir("alice").join(".user-config.json").is_file());

        let cfg = fs::read_to_string(store.user_dir("alice").join(".user-config.json")).unwrap();
        assert!(cfg.contains("\n  \"username\": \"alice\""), "expected 2-space indent: {cfg}");
    }

    #[test]
    fn scan_finds_pages_and_files_but_not_covers() {
        let (_tmp, store) = store();
        store.create_user_tree("alice", 1024).unwrap();
        store.create_library_tree("alice", "notes", "Notes").unwrap();

        fs::write(store.pages_dir("alice", "notes").join("Inbox.md"), "hello").unwrap();
        fs::write(store.files_dir("alice", "notes").join("book.pdf"), b"%PDF-").unwrap();
        fs::write(store.covers_dir("alice", "notes").join("book_cover.jpg"), b"\xff\xd8").unwrap();

        let mut entries = store.scan_library("alice", "notes").unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Inbox.md");
        assert_eq!(entries[0].category, ScanCategory::Page);
        assert_eq!(entries[0].rel_path, "pages/Inbox.md");
        assert_eq!(entries[1].category, ScanCategory::File);
        // sha256("hello")
        assert_eq!(
            entries[0].hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn archive_moves_tree() {
        let (_tmp, store) = store();
        store.create_user_tree("bob", 1024).unwrap();
        let dest = store.archive_user_tree("bob").unwrap();
        assert!(!store.user_dir("bob").exists());
        assert!(dest.is_dir());
        assert!(dest.file_name().unwrap().to_string_lossy().starts_with("bob-"));
    }

    #[test]
    fn promote_resolves_duplicates() {
        let (_tmp, store) = store();
        store.create_user_tree("alice", 1024).unwrap();
        store.create_library_tree("alice", "notes", "Notes").unwrap();

        let staged = store.stage_upload(b"one").unwrap();
        let name = store
            .promote_upload(&staged, "alice", "notes", "doc.pdf", DuplicateMode::Rename)
            .unwrap();
        assert_eq!(name.as_deref(), Some("doc.pdf"));

        let staged = store.stage_upload(b"two").unwrap();
        let name = store
            .promote_upload(&staged, "alice", "notes", "doc.pdf", DuplicateMode::Rename)
            .unwrap();
        assert_eq!(name.as_deref(), Some("doc_1.pdf"));

        let staged = store.stage_upload(b"three").unwrap();
        let name = store
            .promote_upload(&staged, "alice", "notes", "doc.pdf", DuplicateMode::Skip)
            .unwrap();
        assert_eq!(name, None);

        let staged = store.stage_upload(b"four").unwrap();
        let name = store
            .promote_upload(&staged, "alice", "notes", "doc.pdf", DuplicateMode::Replace)
            .unwrap();
        assert_eq!(name.as_deref(), Some("doc.pdf"));
        let content = fs::read(store.files_dir("alice", "notes").join("doc.pdf")).unwrap();
        assert_eq!(content, b"four");
    }

    #[test]
    fn hash_file_matches_hash_bytes() {
        let (_tmp, store) = store();
        let staged = store.stage_upload(b"folio").unwrap();
        assert_eq!(hash_file(&staged).unwrap(), hash_bytes(b"folio"));
    }
}

//! Shared harness for integration tests.
//!
//! Builds a full `AppContext` over an in-memory database and a temp-dir
//! storage root, with one user ("alice") and one library ("notes") ready.

// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use folio_server::init;
use folio_server::library;
use folio_server::types::{AppContext, Library, ServerConfig, User};
use tempfile::TempDir;

pub struct TestHarness {
    pub ctx: AppContext,
    pub user: User,
    pub library: Library,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// File-backed database, for tests that need genuinely concurrent
    /// writers (a `:memory:` pool is pinned to one connection).
    pub async fn new_file_backed() -> Self {
        Self::build(Some("folio-test.db".to_string())).await
    }

    async fn build(db_file: Option<String>) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let database_url = match &db_file {
            Some(name) => {
                format!("sqlite://{}?mode=rwc", temp_dir.path().join(name).display())
            }
            None => "sqlite::memory:".to_string(),
        };
        let config = ServerConfig {
            storage_root: temp_dir.path().join("storage"),
            database_url,
            upload_tmp: temp_dir.path().join("storage/.tmp"),
            session_cookie: "folio_session".to_string(),
        };

        let ctx = init::bootstrap(config).await.expect("bootstrap");

        let user =
            library::create_user(&ctx.db, &ctx.store, "alice", "correct horse", None, false)
                .await
                .expect("user");
        let lib = library::create_library(&ctx.db, &ctx.store, &user, "notes")
            .await
            .expect("library");

        TestHarness { ctx, user, library: lib, _temp_dir: temp_dir }
    }

    /// A second user with their own library, for ownership tests.
    pub async fn other_user(&self) -> (User, Library) {
        let user = library::create_user(
            &self.ctx.db,
            &self.ctx.store,
            "mallory",
            "password99",
            None,
            false,
        )
        .await
        .expect("user");
        let lib = library::create_library(&self.ctx.db, &self.ctx.store, &user, "stash")
            .await
            .expect("library");
        (user, lib)
    }

    pub fn pages_dir(&self) -> std::path::PathBuf {
        self.ctx.store.pages_dir(&self.user.username, &self.library.slug)
    }

    pub fn files_dir(&self) -> std::path::PathBuf {
        self.ctx.store.files_dir(&self.user.username, &self.library.slug)
    }
}

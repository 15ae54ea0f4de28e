//! Startup bootstrap and the `doctor` diagnostic.
//!
//! `bootstrap` builds the process-wide context: database pool (with
//! migrations), content store, and generation registry. `doctor` checks a
//! deployment for the usual misconfigurations and prints ✓/⚠ lines.

use crate::db;
use crate::error::AppResult;
use crate::store::ContentStore;
use crate::types::{AppContext, ServerConfig};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Construct the shared context. Everything process-wide lives here; no
/// ambient singletons.
pub async fn bootstrap(config: ServerConfig) -> AppResult<AppContext> {
    let store = ContentStore::new(&config)?;
    let pool = db::connect(&config.database_url).await?;

    info!(
        storage = %config.storage_root.display(),
        db = %config.database_url,
        "context ready"
    );

    Ok(AppContext {
        db: pool,
        store: Arc::new(store),
        config: Arc::new(config),
        generations: Arc::new(DashMap::new()),
        login_throttle: Arc::new(crate::auth::LoginThrottle::new()),
        start_time: Instant::now(),
    })
}

/// Diagnose a deployment. Returns a process exit code: 0 healthy, 2 broken.
pub async fn run_doctor(config: ServerConfig) -> i32 {
    let mut broken = false;

    // Storage root
    if config.storage_root.is_dir() {
        eprintln!("  ✓ storage root: {}", config.storage_root.display());
    } else {
        eprintln!(
            "  ⚠ storage root missing: {} (created on first serve)",
            config.storage_root.display()
        );
    }

    let probe = config.storage_root.join(".doctor-probe");
    match std::fs::create_dir_all(&config.storage_root)
        .and_then(|_| std::fs::write(&probe, b"ok"))
    {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            eprintln!("  ✓ storage root writable");
        }
        Err(e) => {
            eprintln!("  ✗ storage root not writable: {e}");
            broken = true;
        }
    }

    // Database
    match db::connect(&config.database_url).await {
        Ok(pool) => {
            eprintln!("  ✓ database reachable: {}", config.database_url);
            let users: Result<(i64,), _> =
                sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(&pool).await;
            let libraries: Result<(i64,), _> =
                sqlx::query_as("SELECT COUNT(*) FROM libraries WHERE deleted_at IS NULL")
                    .fetch_one(&pool)
                    .await;
            if let (Ok((u,)), Ok((l,))) = (users, libraries) {
                eprintln!("  ✓ {u} user(s), {l} live library(ies)");
                if u == 0 {
                    eprintln!("    hint: folio admin create-user <name> --admin");
                }
            }

            // Disk trees without a matching user row are a common restore mistake.
            if let Ok(store) = ContentStore::new(&config) {
                if let Ok(dirs) = store.list_user_dirs() {
                    for dir in dirs {
                        let row: Result<Option<(String,)>, _> =
                            sqlx::query_as("SELECT id FROM users WHERE username = ?")
                                .bind(&dir)
                                .fetch_optional(&pool)
                                .await;
                        if matches!(row, Ok(None)) {
                            eprintln!("  ⚠ on-disk user tree '{dir}' has no database row");
                        }
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("  ✗ database unreachable: {e}");
            broken = true;
        }
    }

    if broken {
        2
    } else {
        0
    }
}

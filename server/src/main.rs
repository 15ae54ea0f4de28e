//! Folio binary — serves the HTTP API by default, with direct-database admin
//! subcommands for bootstrap.

use axum::Router;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use folio_server::types::{AppContext, ServerConfig};
use folio_server::{api, auth, init, library, watch};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Personal knowledge-management server — filesystem/database sync, ordered
/// workspaces, and page links.
#[derive(Parser)]
#[command(name = "folio", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Storage root directory (default: $FOLIO_STORAGE_ROOT or ./storage)
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Database DSN (default: $FOLIO_DATABASE_URL or sqlite under the storage root)
    #[arg(long)]
    db: Option<String>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// User management against the database directly (bootstrap path)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Check a deployment and diagnose issues
    Doctor,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create a user (and its storage tree)
    CreateUser {
        username: String,
        /// Read from $FOLIO_ADMIN_PASSWORD when omitted
        #[arg(long)]
        password: Option<String>,
        /// Storage quota in bytes
        #[arg(long)]
        quota: Option<i64>,
        /// Grant the admin flag
        #[arg(long)]
        admin: bool,
    },
    /// Archive a user's tree and delete the account
    DeleteUser { username: String },
    /// List accounts with storage usage
    ListUsers,
    /// Set a new password (invalidates all sessions)
    ResetPassword {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Admin subcommands (exit code 0 ok, 1 user error, 2 system error)
// ---------------------------------------------------------------------------

fn password_arg(flag: Option<String>) -> Result<String, i32> {
    flag.or_else(|| std::env::var("FOLIO_ADMIN_PASSWORD").ok()).ok_or_else(|| {
        eprintln!("error: pass --password or set FOLIO_ADMIN_PASSWORD");
        1
    })
}

async fn run_admin(ctx: &AppContext, command: AdminCommands) -> i32 {
    match command {
        AdminCommands::CreateUser { username, password, quota, admin } => {
            let password = match password_arg(password) {
                Ok(p) => p,
                Err(code) => return code,
            };
            match library::create_user(&ctx.db, &ctx.store, &username, &password, quota, admin)
                .await
            {
                Ok(user) => {
                    println!("created {} ({})", user.username, user.id);
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        AdminCommands::DeleteUser { username } => {
            match library::delete_user(&ctx.db, &ctx.store, &username).await {
                Ok(()) => {
                    println!("archived and deleted {username}");
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        AdminCommands::ListUsers => match library::list_users(&ctx.db).await {
            Ok(users) => {
                for user in users {
                    let used = library::storage_used(&ctx.db, &user.id).await.unwrap_or(0);
                    println!(
                        "{:<20} {:>12} / {:>12} bytes{}",
                        user.username,
                        used,
                        user.storage_quota,
                        if user.is_admin { "  [admin]" } else { "" }
                    );
                }
                0
            }
            Err(e) => {
                eprintln!("error: {e}");
                2
            }
        },
        AdminCommands::ResetPassword { username, password } => {
            let password = match password_arg(password) {
                Ok(p) => p,
                Err(code) => return code,
            };
            match library::reset_password(&ctx.db, &username, &password).await {
                Ok(()) => {
                    println!("password updated for {username}");
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FOLIO_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| "folio=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::from_env(cli.storage_root.clone(), cli.db.clone());

    if let Some(command) = cli.command {
        match command {
            Commands::Doctor => {
                std::process::exit(init::run_doctor(config).await);
            }
            Commands::Completions { shell } => {
                clap_complete::generate(shell, &mut Cli::command(), "folio", &mut std::io::stdout());
                return;
            }
            Commands::Admin { command } => {
                let ctx = match init::bootstrap(config).await {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        eprintln!("error: {e}");
                        std::process::exit(2);
                    }
                };
                std::process::exit(run_admin(&ctx, command).await);
            }
        }
    }

    // Serve mode
    let ctx = match init::bootstrap(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(2);
        }
    };

    // File watcher: incremental sync of out-of-band filesystem changes.
    // Must stay alive for the lifetime of the server.
    let _watcher = watch::start_watcher(ctx.clone());

    // Session cleanup: prune expired sessions every 15 minutes.
    {
        let db = ctx.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(900));
            loop {
                interval.tick().await;
                if let Err(e) = auth::prune_expired(&db).await {
                    error!(error = %e, "session prune failed");
                }
            }
        });
    }

    let app: Router = api::router()
        .layer(axum::extract::DefaultBodyLimit::max(
            (folio_server::types::MAX_UPLOAD_BYTES + 1024 * 1024) as usize,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port, error = %e, "could not bind to port");
            eprintln!("  PORT={port} was set explicitly. Choose a different port.");
            std::process::exit(2);
        })
    } else {
        // Auto-scan: try 8640..=8649
        const BASE: u16 = 8640;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "no free port found");
            eprintln!("  Try: PORT=<port> folio");
            std::process::exit(2);
        })
    };

    let port = listener.local_addr().expect("listener has a local addr").port();
    info!(port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("FOLIO_PORT={port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server crashed");
}

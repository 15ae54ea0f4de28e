//! Folio CLI — remote client for the Folio server's JSON API.
//!
//! Authenticates with an opaque bearer token cached under the user config
//! directory. Exit codes: 0 success, 1 user error (4xx), 2 system error
//! (5xx or transport failure).

use clap::{CommandFactory, Parser, Subcommand};
use reqwest::blocking::multipart;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::exit;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8640";

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Folio CLI — manage libraries, pages, and workspaces from the terminal.
#[derive(Parser)]
#[command(name = "fo", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server URL (default: $FOLIO_SERVER or http://127.0.0.1:8640)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Output raw JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and cache a 30-day token
    Login {
        username: String,
        /// Read from $FOLIO_PASSWORD when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Invalidate and forget the cached token
    Logout,
    /// Show the logged-in user and storage usage
    Whoami,
    /// User administration (requires an admin account)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Library operations
    Libraries {
        #[command(subcommand)]
        command: LibraryCommands,
    },
    /// Page operations
    Pages {
        #[command(subcommand)]
        command: PageCommands,
    },
    /// Workspace operations
    Workspaces {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    CreateUser {
        username: String,
        #[arg(long)]
        password: Option<String>,
        /// Storage quota in bytes
        #[arg(long)]
        quota: Option<i64>,
        #[arg(long)]
        admin: bool,
    },
    DeleteUser { username: String },
    ListUsers,
    ResetPassword {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum LibraryCommands {
    List,
    Create { name: String },
    Delete { id: String },
    /// Force a filesystem/database reconcile
    Sync { id: String },
}

#[derive(Subcommand)]
enum PageCommands {
    /// List pages of a library
    List { library: String },
    Create {
        library: String,
        title: String,
        /// Read the body from a file ('-' for stdin)
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,
    },
    /// Replace a page's body
    Edit {
        id: String,
        /// Read the body from a file ('-' for stdin)
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,
    },
    Delete { id: String },
    /// Upload documents (pdf/epub/images) to a library
    Upload {
        library: String,
        paths: Vec<PathBuf>,
        /// skip | replace | rename
        #[arg(long, default_value = "rename")]
        on_duplicate: String,
    },
    /// Show outgoing links and backlinks
    Links { id: String },
    /// Force a reconcile of the page's library
    Sync { library: String },
    /// Library statistics (pages, words, link health)
    Stats { library: String },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    List { library: String },
    Create { library: String, title: String },
    Delete { id: String },
    /// Show a workspace with its ordered items
    Show { id: String },
    Favorite {
        id: String,
        /// Clear the favorite flag instead
        #[arg(long)]
        unset: bool,
    },
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default)]
struct Credentials {
    server: String,
    token: String,
}

fn credentials_path() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("folio").join("token.json")
}

fn load_credentials() -> Option<Credentials> {
    let raw = std::fs::read_to_string(credentials_path()).ok()?;
    serde_json::from_str(&raw).ok()
}

fn save_credentials(creds: &Credentials) {
    let path = credentials_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(json) = serde_json::to_string_pretty(creds) {
        if std::fs::write(&path, json).is_err() {
            eprintln!("warning: could not write {}", path.display());
        }
    }
}

fn forget_credentials() {
    let _ = std::fs::remove_file(credentials_path());
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

struct Client {
    base: String,
    token: Option<String>,
    http: reqwest::blocking::Client,
}

impl Client {
    fn new(server_flag: Option<String>) -> Self {
        let creds = load_credentials();
        let base = server_flag
            .or_else(|| std::env::var("FOLIO_SERVER").ok())
            .or_else(|| creds.as_ref().map(|c| c.server.clone()))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());
        Client {
            base: base.trim_end_matches('/').to_string(),
            token: creds.map(|c| c.token),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> reqwest::blocking::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        req
    }

    /// Send and decode, exiting with the mapped code on failure.
    fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Value {
        let response = self.request(method, path, body).send().unwrap_or_else(|e| {
            eprintln!("error: could not reach {}: {e}", self.base);
            exit(2);
        });
        decode(response)
    }

    fn get(&self, path: &str) -> Value {
        self.send(reqwest::Method::GET, path, None)
    }

    fn post(&self, path: &str, body: Value) -> Value {
        self.send(reqwest::Method::POST, path, Some(body))
    }

    fn put(&self, path: &str, body: Value) -> Value {
        self.send(reqwest::Method::PUT, path, Some(body))
    }

    fn delete(&self, path: &str) -> Value {
        self.send(reqwest::Method::DELETE, path, None)
    }
}

fn decode(response: reqwest::blocking::Response) -> Value {
    let status = response.status();
    let body: Value = response.json().unwrap_or(Value::Null);
    if status.is_success() {
        return body;
    }

    let code = body["error"]["code"].as_str().unwrap_or("ERROR");
    let message = body["error"]["message"].as_str().unwrap_or("request failed");
    eprintln!("error [{code}]: {message}");
    exit(if status.is_client_error() { 1 } else { 2 });
}

fn password_arg(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("FOLIO_PASSWORD").ok()).unwrap_or_else(|| {
        eprintln!("error: pass --password or set FOLIO_PASSWORD");
        exit(1);
    })
}

fn body_arg(file: Option<PathBuf>, content: Option<String>) -> String {
    if let Some(content) = content {
        return content;
    }
    match file {
        Some(path) if path.as_os_str() == "-" => {
            use std::io::Read;
            let mut buf = String::new();
            if std::io::stdin().read_to_string(&mut buf).is_err() {
                eprintln!("error: could not read stdin");
                exit(1);
            }
            buf
        }
        Some(path) => std::fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("error: could not read {}: {e}", path.display());
            exit(1);
        }),
        None => String::new(),
    }
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("folio=warn".parse().expect("static directive")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let client = Client::new(cli.server.clone());

    match cli.command {
        Commands::Login { username, password } => {
            let password = password_arg(password);
            let body = client.post(
                "/api/auth/login",
                json!({ "username": username, "password": password, "cli": true }),
            );
            let token = body["token"].as_str().unwrap_or_default().to_string();
            if token.is_empty() {
                eprintln!("error: server returned no token");
                exit(2);
            }
            save_credentials(&Credentials { server: client.base.clone(), token });
            if cli.json {
                print_json(&body);
            } else {
                println!("logged in as {username}");
            }
        }
        Commands::Logout => {
            if client.token.is_some() {
                client.post("/api/auth/logout", json!({}));
            }
            forget_credentials();
            if !cli.json {
                println!("logged out");
            }
        }
        Commands::Whoami => {
            let body = client.get("/api/auth/whoami");
            if cli.json {
                print_json(&body);
            } else {
                let user = &body["user"];
                println!(
                    "{} (quota {} / used {})",
                    user["username"].as_str().unwrap_or("?"),
                    user["storageQuota"],
                    body["storageUsed"]
                );
            }
        }
        Commands::Admin { command } => run_admin(&client, cli.json, command),
        Commands::Libraries { command } => run_libraries(&client, cli.json, command),
        Commands::Pages { command } => run_pages(&client, cli.json, command),
        Commands::Workspaces { command } => run_workspaces(&client, cli.json, command),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "fo", &mut std::io::stdout());
        }
    }
}

fn run_admin(client: &Client, json_out: bool, command: AdminCommands) {
    match command {
        AdminCommands::CreateUser { username, password, quota, admin } => {
            let password = password_arg(password);
            let body = client.post(
                "/api/admin/users",
                json!({
                    "username": username,
                    "password": password,
                    "storageQuota": quota,
                    "isAdmin": admin,
                }),
            );
            if json_out {
                print_json(&body);
            } else {
                println!("created {}", body["username"].as_str().unwrap_or("?"));
            }
        }
        AdminCommands::DeleteUser { username } => {
            let body = client.delete(&format!("/api/admin/users/{username}"));
            if json_out {
                print_json(&body);
            } else {
                println!("archived and deleted {username}");
            }
        }
        AdminCommands::ListUsers => {
            let body = client.get("/api/admin/users");
            if json_out {
                print_json(&body);
            } else if let Some(entries) = body.as_array() {
                for entry in entries {
                    let user = &entry["user"];
                    println!(
                        "{:<20} {:>12} / {:>12} bytes{}",
                        user["username"].as_str().unwrap_or("?"),
                        entry["storageUsed"],
                        user["storageQuota"],
                        if user["isAdmin"].as_bool().unwrap_or(false) { "  [admin]" } else { "" }
                    );
                }
            }
        }
        AdminCommands::ResetPassword { username, password } => {
            let password = password_arg(password);
            client.put(
                &format!("/api/admin/users/{username}/password"),
                json!({ "password": password }),
            );
            if !json_out {
                println!("password updated for {username}");
            }
        }
    }
}

fn run_libraries(client: &Client, json_out: bool, command: LibraryCommands) {
    match command {
        LibraryCommands::List => {
            let body = client.get("/api/libraries");
            if json_out {
                print_json(&body);
            } else if let Some(libraries) = body.as_array() {
                for lib in libraries {
                    println!(
                        "{}  {:<24} {}",
                        lib["id"].as_str().unwrap_or("?"),
                        lib["slug"].as_str().unwrap_or("?"),
                        lib["name"].as_str().unwrap_or("")
                    );
                }
            }
        }
        LibraryCommands::Create { name } => {
            let body = client.post("/api/libraries", json!({ "name": name }));
            if json_out {
                print_json(&body);
            } else {
                println!(
                    "created {} ({})",
                    body["slug"].as_str().unwrap_or("?"),
                    body["id"].as_str().unwrap_or("?")
                );
            }
        }
        LibraryCommands::Delete { id } => {
            let body = client.delete(&format!("/api/libraries/{id}"));
            if json_out {
                print_json(&body);
            } else {
                println!("deleted");
            }
        }
        LibraryCommands::Sync { id } => {
            let body = client.post(&format!("/api/libraries/{id}/sync"), json!({}));
            if json_out {
                print_json(&body);
            } else {
                println!(
                    "synced: {} created, {} updated, {} removed, {} unchanged, {} errors",
                    body["created"], body["updated"], body["removed"], body["noChange"],
                    body["errors"]
                );
            }
        }
    }
}

fn run_pages(client: &Client, json_out: bool, command: PageCommands) {
    match command {
        PageCommands::List { library } => {
            let body = client.get(&format!("/api/libraries/{library}/pages"));
            if json_out {
                print_json(&body);
            } else if let Some(pages) = body.as_array() {
                for page in pages {
                    println!(
                        "{}  [{}] {}",
                        page["id"].as_str().unwrap_or("?"),
                        page["pageType"].as_str().unwrap_or("?"),
                        page["title"].as_str().unwrap_or("(untitled)")
                    );
                }
            }
        }
        PageCommands::Create { library, title, file, content } => {
            let content = body_arg(file, content);
            let body = client.post(
                &format!("/api/libraries/{library}/pages"),
                json!({ "title": title, "content": content }),
            );
            if json_out {
                print_json(&body);
            } else {
                println!("created '{title}' ({})", body["id"].as_str().unwrap_or("?"));
            }
        }
        PageCommands::Edit { id, file, content } => {
            let content = body_arg(file, content);
            let body = client.put(&format!("/api/pages/{id}"), json!({ "content": content }));
            if json_out {
                print_json(&body);
            } else {
                println!("updated ({} words)", body["wordCount"]);
            }
        }
        PageCommands::Delete { id } => {
            client.delete(&format!("/api/pages/{id}"));
            if !json_out {
                println!("deleted");
            }
        }
        PageCommands::Upload { library, paths, on_duplicate } => {
            if paths.is_empty() {
                eprintln!("error: no files given");
                exit(1);
            }
            let mut form = multipart::Form::new();
            for path in &paths {
                form = form.file("files", path).unwrap_or_else(|e| {
                    eprintln!("error: could not read {}: {e}", path.display());
                    exit(1);
                });
            }
            let response = client
                .request(
                    reqwest::Method::POST,
                    &format!("/api/libraries/{library}/files?onDuplicate={on_duplicate}"),
                    None,
                )
                .multipart(form)
                .send()
                .unwrap_or_else(|e| {
                    eprintln!("error: could not reach {}: {e}", client.base);
                    exit(2);
                });
            let body = decode(response);
            if json_out {
                print_json(&body);
            } else if let Some(results) = body.as_array() {
                for result in results {
                    let status = result["status"].as_str().unwrap_or("?");
                    let name = result["fileName"].as_str().unwrap_or("?");
                    match status {
                        "failed" => println!(
                            "{name}: failed ({})",
                            result["error"].as_str().unwrap_or("unknown")
                        ),
                        other => println!("{name}: {other}"),
                    }
                }
            }
        }
        PageCommands::Links { id } => {
            let links = client.get(&format!("/api/pages/{id}/links"));
            let backlinks = client.get(&format!("/api/pages/{id}/backlinks"));
            if json_out {
                print_json(&json!({ "links": links, "backlinks": backlinks }));
            } else {
                println!(
                    "links: {} ({} broken)",
                    links["linksFound"], links["brokenLinks"]
                );
                if let Some(details) = links["details"].as_array() {
                    for link in details {
                        let target = link["targetPageId"].as_str().unwrap_or("(broken)");
                        println!("  -> [[{}]] {}", link["linkText"].as_str().unwrap_or("?"), target);
                    }
                }
                if let Some(entries) = backlinks.as_array() {
                    println!("backlinks: {}", entries.len());
                    for entry in entries {
                        println!(
                            "  <- {} ({})",
                            entry["sourceTitle"].as_str().unwrap_or("(untitled)"),
                            entry["sourcePageId"].as_str().unwrap_or("?")
                        );
                    }
                }
            }
        }
        PageCommands::Sync { library } => {
            run_libraries(client, json_out, LibraryCommands::Sync { id: library });
        }
        PageCommands::Stats { library } => {
            let body = client.get(&format!("/api/libraries/{library}/stats"));
            if json_out {
                print_json(&body);
            } else {
                println!("pages:      {}", body["pages"]);
                println!("files:      {}", body["files"]);
                println!("workspaces: {}", body["workspaces"]);
                println!("words:      {}", body["totalWords"]);
                println!(
                    "links:      {} total, {} broken, health {:.2}",
                    body["links"]["total"],
                    body["links"]["broken"],
                    body["links"]["health"].as_f64().unwrap_or(1.0)
                );
            }
        }
    }
}

fn run_workspaces(client: &Client, json_out: bool, command: WorkspaceCommands) {
    match command {
        WorkspaceCommands::List { library } => {
            let body = client.get(&format!("/api/libraries/{library}/workspaces"));
            if json_out {
                print_json(&body);
            } else if let Some(workspaces) = body.as_array() {
                for ws in workspaces {
                    println!(
                        "{}  {}{}",
                        ws["id"].as_str().unwrap_or("?"),
                        ws["title"].as_str().unwrap_or("?"),
                        if ws["isFavorited"].as_bool().unwrap_or(false) { "  *" } else { "" }
                    );
                }
            }
        }
        WorkspaceCommands::Create { library, title } => {
            let body = client
                .post(&format!("/api/libraries/{library}/workspaces"), json!({ "title": title }));
            if json_out {
                print_json(&body);
            } else {
                println!("created '{title}' ({})", body["id"].as_str().unwrap_or("?"));
            }
        }
        WorkspaceCommands::Delete { id } => {
            client.delete(&format!("/api/workspaces/{id}"));
            if !json_out {
                println!("deleted");
            }
        }
        WorkspaceCommands::Show { id } => {
            let body = client.get(&format!("/api/workspaces/{id}"));
            if json_out {
                print_json(&body);
            } else {
                println!("{}", body["title"].as_str().unwrap_or("?"));
                if let Some(items) = body["items"].as_array() {
                    for item in items {
                        let depth = item["depth"].as_u64().unwrap_or(0) as usize;
                        println!(
                            "{:>3}  {}{} [{}] {}",
                            item["position"],
                            "  ".repeat(depth),
                            if item["isInAiContext"].as_bool().unwrap_or(false) { "@" } else { " " },
                            item["itemKind"].as_str().unwrap_or("?"),
                            item["title"].as_str().unwrap_or("(untitled)")
                        );
                    }
                }
            }
        }
        WorkspaceCommands::Favorite { id, unset } => {
            let body = client.post(
                &format!("/api/workspaces/{id}/favorite"),
                json!({ "isFavorited": !unset }),
            );
            if json_out {
                print_json(&body);
            } else {
                println!("{}", if unset { "unfavorited" } else { "favorited" });
            }
        }
    }
}

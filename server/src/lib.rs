//! Folio server library.
//!
//! A personal knowledge-management server: a hierarchical on-disk content
//! tree kept in bidirectional sync with a relational metadata store, ordered
//! mixed-kind workspaces over that content, and a `[[title]]` link graph.
//!
//! The filesystem owns content bytes; the database owns identity, ordering,
//! relationships, and derived metadata.

pub mod api;
pub mod auth;
pub mod db;
pub mod error;
pub mod files;
pub mod init;
pub mod library;
pub mod links;
pub mod pages;
pub mod process;
pub mod slug;
pub mod store;
pub mod stream;
pub mod sync;
pub mod types;
pub mod watch;
pub mod workspace;

pub use error::{AppError, AppResult};
pub use types::{AppContext, ServerConfig};

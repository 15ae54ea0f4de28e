//! Per-kind file processors.
//!
//! Processors are flat and selected by extension — no trait objects, just a
//! dispatch function returning a uniform record. A parse failure never
//! aborts ingestion: the record comes back with `Outcome::Failed` and the
//! caller persists the row with `processing_status = failed`.

pub mod epub;
pub mod image;
pub mod markdown;
pub mod pdf;

use crate::types::{FileType, PREVIEW_CHARS};
use serde::Serialize;
use std::path::Path;

/// Processing outcome preserved on the File row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Failed(msg) => Some(msg),
            Outcome::Complete => None,
        }
    }
}

/// Structured metadata bag, per kind.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    // pdf
    pub page_count: Option<i64>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    // epub
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub isbn: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
    pub chapter_count: Option<i64>,
    pub has_toc: Option<bool>,
    pub has_images: Option<bool>,
    /// Absolute path of the extracted cover under `files/covers/`.
    pub cover_path: Option<String>,
    // image
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub color_type: Option<String>,
}

/// Uniform processor output: canonical title, display preview, metadata bag,
/// author (where the kind has one), and the processing outcome.
#[derive(Debug, Clone)]
pub struct Processed {
    pub title: String,
    pub author: Option<String>,
    pub preview: String,
    pub metadata: FileMetadata,
    pub outcome: Outcome,
}

/// Run the processor for a File kind. `covers_dir` receives extracted EPUB
/// covers.
pub fn process_file(path: &Path, file_type: FileType, covers_dir: &Path) -> Processed {
    match file_type {
        FileType::Pdf => pdf::process(path),
        FileType::Epub => epub::process(path, covers_dir),
        FileType::Image => image::process(path),
    }
}

/// First `PREVIEW_CHARS` chars on a char boundary, whitespace-normalized.
pub fn make_preview(text: &str) -> String {
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(PREVIEW_CHARS).collect()
}

/// Title fallback: the filename stem.
pub fn title_from_filename(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "Untitled".into())
}

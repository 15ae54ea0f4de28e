//! Image dimension and color extraction.

use crate::process::{title_from_filename, FileMetadata, Outcome, Processed};
use image::ImageReader;
use std::path::Path;
use tracing::debug;

pub fn process(path: &Path) -> Processed {
    let title = title_from_filename(path);

    // Header-only probe gets dimensions without decoding pixel data.
    let dimensions = ImageReader::open(path)
        .ok()
        .and_then(|r| r.with_guessed_format().ok())
        .and_then(|r| r.into_dimensions().ok());

    let Some((width, height)) = dimensions else {
        // Size-only fallback: the row is still created, marked failed.
        debug!(path = %path.display(), "image dimensions unreadable");
        return Processed {
            title,
            author: None,
            preview: String::new(),
            metadata: FileMetadata::default(),
            outcome: Outcome::Failed("could not read image header".to_string()),
        };
    };

    // Color metadata requires a decode; dimensions alone are fine when the
    // pixel data is truncated or the format is only partially supported.
    let color_type = ImageReader::open(path)
        .ok()
        .and_then(|r| r.with_guessed_format().ok())
        .and_then(|r| r.decode().ok())
        .map(|img| format!("{:?}", img.color()));

    let preview = format!("{width}\u{00d7}{height} image");

    Processed {
        title,
        author: None,
        preview,
        metadata: FileMetadata {
            width: Some(width as i64),
            height: Some(height as i64),
            color_type,
            ..FileMetadata::default()
        },
        outcome: Outcome::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smallest valid 1x1 PNG (8-bit grayscale).
    const TINY_PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00,
        0x00, 0x3A, 0x7E, 0x9B, 0x55, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78,
        0x9C, 0x63, 0x62, 0x00, 0x00, 0x00, 0x06, 0x00, 0x03, 0x36, 0x37, 0x7C, 0xA8, 0x00,
        0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    #[test]
    fn png_dimensions() {
        let tmp = tempfile::NamedTempFile::with_suffix(".png").unwrap();
        std::fs::write(tmp.path(), TINY_PNG).unwrap();
        let processed = process(tmp.path());
        assert_eq!(processed.metadata.width, Some(1));
        assert_eq!(processed.metadata.height, Some(1));
        assert_eq!(processed.outcome, Outcome::Complete);
    }

    #[test]
    fn garbage_falls_back_to_size_only() {
        let tmp = tempfile::NamedTempFile::with_suffix(".jpg").unwrap();
        std::fs::write(tmp.path(), b"not an image").unwrap();
        let processed = process(tmp.path());
        assert!(processed.outcome.is_failed());
        assert_eq!(processed.metadata.width, None);
    }
}

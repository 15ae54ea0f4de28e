//! PDF metadata and text extraction.
//!
//! A parse failure still yields a record — the File row is created with
//! `processing_status = failed` and the error message preserved.

use crate::process::{make_preview, title_from_filename, FileMetadata, Outcome, Processed};
use lopdf::{Document, Object};
use std::path::Path;
use tracing::debug;

/// Pages fed into the text extraction for the preview.
const PREVIEW_PAGES: usize = 5;

pub fn process(path: &Path) -> Processed {
    match try_process(path) {
        Ok(processed) => processed,
        Err(message) => {
            debug!(path = %path.display(), error = %message, "pdf processing failed");
            Processed {
                title: title_from_filename(path),
                author: None,
                preview: String::new(),
                metadata: FileMetadata::default(),
                outcome: Outcome::Failed(message),
            }
        }
    }
}

fn try_process(path: &Path) -> Result<Processed, String> {
    let doc = Document::load(path).map_err(|e| format!("pdf parse error: {e}"))?;

    let pages = doc.get_pages();
    let page_count = pages.len() as i64;

    let info = info_dict(&doc);
    let get = |key: &[u8]| info.and_then(|d| d.get(key).ok()).and_then(decode_pdf_string);

    let title = get(b"Title").filter(|t| !t.trim().is_empty());
    let author = get(b"Author");

    let page_numbers: Vec<u32> = pages.keys().copied().take(PREVIEW_PAGES).collect();
    let text = doc.extract_text(&page_numbers).unwrap_or_default();

    let metadata = FileMetadata {
        page_count: Some(page_count),
        subject: get(b"Subject"),
        creator: get(b"Creator"),
        producer: get(b"Producer"),
        creation_date: get(b"CreationDate"),
        modification_date: get(b"ModDate"),
        ..FileMetadata::default()
    };

    Ok(Processed {
        title: title.unwrap_or_else(|| title_from_filename(path)),
        author,
        preview: make_preview(&text),
        metadata,
        outcome: Outcome::Complete,
    })
}

fn info_dict(doc: &Document) -> Option<&lopdf::Dictionary> {
    let obj = doc.trailer.get(b"Info").ok()?;
    let resolved = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    resolved.as_dict().ok()
}

/// PDF text strings are UTF-16BE when they carry a BOM, else PDFDocEncoding
/// (close enough to Latin-1 for the metadata we keep).
fn decode_pdf_string(obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };
    let text = if bytes.starts_with(&[0xFE, 0xFF]) {
        let (decoded, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        decoded.into_owned()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_yields_failed_outcome_not_panic() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a pdf at all").unwrap();
        let processed = process(tmp.path());
        assert!(processed.outcome.is_failed());
        assert!(!processed.title.is_empty());
    }

    #[test]
    fn utf16_metadata_strings_decode() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in "Tïtle".encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        let obj = Object::String(bytes, lopdf::StringFormat::Literal);
        assert_eq!(decode_pdf_string(&obj).unwrap(), "Tïtle");
    }
}

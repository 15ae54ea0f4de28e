//! Markdown/text processing: encoding sniff, frontmatter, title derivation,
//! and structure counts.

use crate::error::{AppError, AppResult};
use crate::process::make_preview;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use std::collections::BTreeMap;
use std::path::Path;

/// Frontmatter must close within this many bytes of the body start.
const FRONTMATTER_WINDOW: usize = 4 * 1024;

/// Binary rejection thresholds over the first 1 KB.
const SNIFF_WINDOW: usize = 1024;
const MAX_NUL_RATIO: f64 = 0.01;
const MAX_NONPRINT_RATIO: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct ProcessedText {
    pub title: String,
    /// Decoded body with frontmatter still in place (content bytes are
    /// owned by the filesystem; we never rewrite them here).
    pub body: String,
    pub preview: String,
    pub frontmatter: BTreeMap<String, String>,
    pub word_count: usize,
    pub heading_count: usize,
    pub link_count: usize,
    pub tags: Vec<String>,
}

/// Decode file bytes with a BOM-aware sniff (UTF-8, UTF-16 LE/BE).
///
/// Without a BOM the bytes are checked for binary content: more than 1% NUL
/// or 10% non-printable in the first 1 KB rejects the file.
pub fn decode_text(path: &Path, bytes: &[u8]) -> AppResult<String> {
    if let Some(stripped) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return Ok(String::from_utf8_lossy(stripped).into_owned());
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
        return Ok(text.into_owned());
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        return Ok(text.into_owned());
    }

    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if !window.is_empty() {
        let nul = window.iter().filter(|&&b| b == 0).count();
        let nonprint = window
            .iter()
            .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
            .count();
        let len = window.len() as f64;
        if nul as f64 / len > MAX_NUL_RATIO || nonprint as f64 / len > MAX_NONPRINT_RATIO {
            return Err(AppError::Processing(format!(
                "{} looks binary, refusing to ingest as text",
                path.display()
            )));
        }
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Extract simple `key: value` frontmatter when the first line is `---` and
/// a closing `---` follows within 4 KB. Quotes around values are stripped.
/// Returns the pairs and the body with the block removed.
pub fn extract_frontmatter(text: &str) -> (BTreeMap<String, String>, &str) {
    let mut map = BTreeMap::new();

    let Some(rest) = text.strip_prefix("---").and_then(|r| r.strip_prefix('\n').or_else(|| r.strip_prefix("\r\n"))) else {
        return (map, text);
    };

    let window_end = rest
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= FRONTMATTER_WINDOW)
        .unwrap_or(rest.len());
    let window = &rest[..window_end];

    let mut close: Option<(usize, usize)> = None; // (block_end, closing_line_len)
    let mut offset = 0usize;
    for line in window.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == "---" {
            close = Some((offset, line.len()));
            break;
        }
        offset += line.len();
    }
    let Some(close) = close else {
        return (map, text);
    };

    let block = &rest[..close.0];
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        map.insert(key.to_string(), value.to_string());
    }

    let body = rest.get(close.0 + close.1..).unwrap_or("");
    (map, body)
}

/// Derive a display title: frontmatter `title`, else the first short
/// non-punctuated line, else the filename stem.
pub fn derive_title(
    frontmatter: &BTreeMap<String, String>,
    body: &str,
    path: &Path,
) -> String {
    if let Some(title) = frontmatter.get("title").filter(|t| !t.is_empty()) {
        return title.clone();
    }

    for line in body.lines().take(10) {
        let candidate = line.trim().trim_start_matches('#').trim();
        if candidate.is_empty() || candidate.chars().count() > 80 {
            continue;
        }
        if candidate.chars().any(|c| c.is_alphanumeric()) {
            return candidate.to_string();
        }
    }

    crate::process::title_from_filename(path)
}

/// Hashtag-style tags: `#word` preceded by start-of-line or whitespace.
pub fn extract_tags(body: &str) -> Vec<String> {
    let re = regex::Regex::new(r"(?:^|\s)#([A-Za-z][A-Za-z0-9_-]*)").expect("static regex");
    let mut tags: Vec<String> = Vec::new();
    for cap in re.captures_iter(body) {
        let tag = cap[1].to_lowercase();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Full markdown/text pipeline over decoded content.
pub fn process_text(path: &Path, bytes: &[u8]) -> AppResult<ProcessedText> {
    let text = decode_text(path, bytes)?;
    let (frontmatter, body) = extract_frontmatter(&text);

    let title = derive_title(&frontmatter, body, path);

    let mut heading_count = 0usize;
    let mut link_count = 0usize;
    let mut plain = String::with_capacity(body.len());
    for event in Parser::new(body) {
        match event {
            Event::Start(Tag::Heading { .. }) => heading_count += 1,
            Event::Start(Tag::Link { .. }) => link_count += 1,
            Event::Text(t) | Event::Code(t) => {
                plain.push_str(&t);
                plain.push(' ');
            }
            Event::End(TagEnd::Paragraph) => plain.push(' '),
            _ => {}
        }
    }
    let word_count = plain.split_whitespace().count();
    let tags = extract_tags(body);

    Ok(ProcessedText {
        title,
        body: text.clone(),
        preview: make_preview(body),
        frontmatter,
        word_count,
        heading_count,
        link_count,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_bom_is_stripped() {
        let bytes = b"\xEF\xBB\xBFhello";
        assert_eq!(decode_text(Path::new("a.md"), bytes).unwrap(), "hello");
    }

    #[test]
    fn utf16le_decodes() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(Path::new("a.md"), &bytes).unwrap(), "hi");
    }

    #[test]
    fn binary_content_is_rejected() {
        let mut bytes = vec![b'a'; 100];
        bytes.extend_from_slice(&[0u8; 20]);
        assert!(decode_text(Path::new("a.md"), &bytes).is_err());
    }

    #[test]
    fn frontmatter_parses_and_strips_quotes() {
        let text = "---\ntitle: \"My Note\"\nauthor: 'jo'\n---\nBody here";
        let (fm, body) = extract_frontmatter(text);
        assert_eq!(fm.get("title").unwrap(), "My Note");
        assert_eq!(fm.get("author").unwrap(), "jo");
        assert_eq!(body, "Body here");
    }

    #[test]
    fn unclosed_frontmatter_is_left_alone() {
        let text = "---\ntitle: x\nno close";
        let (fm, body) = extract_frontmatter(text);
        assert!(fm.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn title_fallback_chain() {
        let fm = BTreeMap::new();
        assert_eq!(derive_title(&fm, "# First Heading\nmore", Path::new("f.md")), "First Heading");
        assert_eq!(derive_title(&fm, "***\n---\n", Path::new("Plan B.md")), "Plan B");

        let mut fm = BTreeMap::new();
        fm.insert("title".to_string(), "Front".to_string());
        assert_eq!(derive_title(&fm, "# Other", Path::new("f.md")), "Front");
    }

    #[test]
    fn counts_and_tags() {
        let text = "# One\n\nHello [link](http://x) world #rust #Rust #2bad\n\n## Two\n";
        let p = process_text(Path::new("n.md"), text.as_bytes()).unwrap();
        assert_eq!(p.heading_count, 2);
        assert_eq!(p.link_count, 1);
        assert_eq!(p.tags, vec!["rust"]);
        assert!(p.word_count >= 4);
    }
}

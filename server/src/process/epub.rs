//! EPUB metadata and cover extraction.
//!
//! An EPUB is a ZIP container: `META-INF/container.xml` points at the OPF
//! package document, which carries Dublin Core metadata, the manifest, and
//! the spine. The file is validated by ZIP signature before any parsing.
//! When the manifest declares a cover image it is decoded and written to
//! `files/covers/<basename>_cover.<ext>`.

use crate::process::{make_preview, title_from_filename, FileMetadata, Outcome, Processed};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Default)]
struct ManifestItem {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

#[derive(Debug, Default)]
struct OpfData {
    title: Option<String>,
    creator: Option<String>,
    publisher: Option<String>,
    language: Option<String>,
    identifiers: Vec<String>,
    date: Option<String>,
    description: Option<String>,
    manifest: Vec<ManifestItem>,
    spine_count: i64,
    cover_meta_id: Option<String>,
}

pub fn process(path: &Path, covers_dir: &Path) -> Processed {
    match try_process(path, covers_dir) {
        Ok(processed) => processed,
        Err(message) => {
            debug!(path = %path.display(), error = %message, "epub processing failed");
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

fn try_process(path: &Path, covers_dir: &Path) -> Result<Processed, String> {
    let file = fs::File::open(path).map_err(|e| format!("open error: {e}"))?;
    {
        let mut sig = [0u8; 4];
        let mut probe = &file;
        probe.read_exact(&mut sig).map_err(|e| format!("read error: {e}"))?;
        if sig != ZIP_SIGNATURE {
            return Err("not a zip archive (bad signature)".to_string());
        }
    }
    let file = fs::File::open(path).map_err(|e| format!("open error: {e}"))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| format!("zip error: {e}"))?;

    let container = read_entry(&mut archive, "META-INF/container.xml")?;
    let container_xml = String::from_utf8_lossy(&container);
    let opf_path =
        parse_container(&container_xml).ok_or_else(|| "container.xml has no rootfile".to_string())?;

    let opf_bytes = read_entry(&mut archive, &opf_path)?;
    let opf_xml = String::from_utf8_lossy(&opf_bytes);
    let opf = parse_opf(&opf_xml).map_err(|e| format!("opf parse error: {e}"))?;

    let opf_dir = Path::new(&opf_path).parent().unwrap_or(Path::new(""));

    let has_toc = opf.manifest.iter().any(|i| {
        i.properties.split_whitespace().any(|p| p == "nav")
            || i.media_type == "application/x-dtbncx+xml"
    });
    let has_images = opf.manifest.iter().any(|i| i.media_type.starts_with("image/"));

    let cover_path = find_cover_item(&opf)
        .and_then(|item| extract_cover(&mut archive, opf_dir, &item.href, path, covers_dir));

    let isbn = find_isbn(&opf.identifiers);

    let metadata = FileMetadata {
        publisher: opf.publisher.clone(),
        language: opf.language.clone(),
        isbn,
        date: opf.date.clone(),
        description: opf.description.clone(),
        chapter_count: Some(opf.spine_count),
        has_toc: Some(has_toc),
        has_images: Some(has_images),
        cover_path: cover_path.map(|p| p.to_string_lossy().to_string()),
        ..FileMetadata::default()
    };

    Ok(Processed {
        title: opf
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from_filename(path)),
        author: opf.creator,
        preview: make_preview(opf.description.as_deref().unwrap_or("")),
        metadata,
        outcome: Outcome::Complete,
    })
}

fn read_entry(
    archive: &mut zip::ZipArchive<fs::File>,
    name: &str,
) -> Result<Vec<u8>, String> {
    let mut entry =
        archive.by_name(name).map_err(|e| format!("missing zip entry {name}: {e}"))?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf).map_err(|e| format!("read error in {name}: {e}"))?;
    Ok(buf)
}

/// `META-INF/container.xml` → the `full-path` of the first rootfile.
fn parse_container(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"full-path" {
                            return attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Parse the OPF package document: Dublin Core metadata, manifest, spine.
fn parse_opf(xml: &str) -> Result<OpfData, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut data = OpfData::default();
    let mut current_dc: Option<Vec<u8>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"title" | b"creator" | b"publisher" | b"language" | b"identifier"
                    | b"date" | b"description" => current_dc = Some(local),
                    b"item" => data.manifest.push(manifest_item(&e)),
                    b"itemref" => data.spine_count += 1,
                    b"meta" => capture_cover_meta(&e, &mut data),
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"item" => data.manifest.push(manifest_item(&e)),
                    b"itemref" => data.spine_count += 1,
                    b"meta" => capture_cover_meta(&e, &mut data),
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some(field) = &current_dc {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match field.as_slice() {
                        b"title" => data.title.get_or_insert(text),
                        b"creator" => data.creator.get_or_insert(text),
                        b"publisher" => data.publisher.get_or_insert(text),
                        b"language" => data.language.get_or_insert(text),
                        b"date" => data.date.get_or_insert(text),
                        b"description" => data.description.get_or_insert(text),
                        b"identifier" => {
                            data.identifiers.push(text);
                            continue;
                        }
                        _ => continue,
                    };
                }
            }
            Event::End(_) => current_dc = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(data)
}

fn manifest_item(e: &quick_xml::events::BytesStart<'_>) -> ManifestItem {
    let mut item = ManifestItem::default();
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default().into_owned();
        match attr.key.local_name().as_ref() {
            b"id" => item.id = value,
            b"href" => item.href = value,
            b"media-type" => item.media_type = value,
            b"properties" => item.properties = value,
            _ => {}
        }
    }
    item
}

/// `<meta name="cover" content="<manifest-id>"/>` (EPUB 2 convention).
fn capture_cover_meta(e: &quick_xml::events::BytesStart<'_>, data: &mut OpfData) {
    let mut name = None;
    let mut content = None;
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default().into_owned();
        match attr.key.local_name().as_ref() {
            b"name" => name = Some(value),
            b"content" => content = Some(value),
            _ => {}
        }
    }
    if name.as_deref() == Some("cover") {
        data.cover_meta_id = content;
    }
}

/// EPUB 3 `properties="cover-image"` wins over the EPUB 2 meta pointer.
fn find_cover_item(opf: &OpfData) -> Option<&ManifestItem> {
    opf.manifest
        .iter()
        .find(|i| i.properties.split_whitespace().any(|p| p == "cover-image"))
        .or_else(|| {
            let id = opf.cover_meta_id.as_deref()?;
            opf.manifest.iter().find(|i| i.id == id)
        })
        .filter(|i| i.media_type.starts_with("image/") || !i.href.is_empty())
}

fn find_isbn(identifiers: &[String]) -> Option<String> {
    for id in identifiers {
        let lower = id.to_ascii_lowercase();
        if let Some(rest) = lower.rfind("isbn").map(|i| &lower[i + 4..]) {
            let digits: String =
                rest.chars().filter(|c| c.is_ascii_digit() || *c == 'x').collect();
            if digits.len() >= 10 {
                return Some(digits);
            }
        }
        let digits: String = id.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() == 13 && (digits.starts_with("978") || digits.starts_with("979")) {
            return Some(digits);
        }
    }
    None
}

/// Decode the cover entry and write `<basename>_cover.<ext>` under
/// `files/covers/`, returning the absolute path.
fn extract_cover(
    archive: &mut zip::ZipArchive<fs::File>,
    opf_dir: &Path,
    href: &str,
    epub_path: &Path,
    covers_dir: &Path,
) -> Option<PathBuf> {
    let href = href.replace("%20", " ");
    let entry_name = normalize_zip_path(&opf_dir.join(&href));
    let bytes = read_entry(archive, &entry_name).ok()?;

    let ext = Path::new(&href)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "gif" | "webp"))
        .unwrap_or_else(|| "jpg".to_string());

    let basename = epub_path.file_stem()?.to_string_lossy().to_string();
    let dest = covers_dir.join(format!("{basename}_cover.{ext}"));
    fs::create_dir_all(covers_dir).ok()?;
    fs::write(&dest, bytes).ok()?;
    Some(dest)
}

/// Resolve `.`/`..` lexically and force forward slashes — zip entry names
/// never contain backslashes or parent components.
fn normalize_zip_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                parts.pop();
            }
            std::path::Component::Normal(c) => parts.push(c.to_string_lossy().to_string()),
            _ => {}
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" xmlns:dc="http://purl.org/dc/elements/1.1/" version="3.0">
  <metadata>
    <dc:title>The Test Book</dc:title>
    <dc:creator>A. Author</dc:creator>
    <dc:publisher>Test Press</dc:publisher>
    <dc:language>en</dc:language>
    <dc:identifier>urn:isbn:9781234567897</dc:identifier>
    <dc:date>2021-06-01</dc:date>
    <dc:description>A short description of the book.</dc:description>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine>
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#;

    fn build_epub(path: &Path) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = SimpleFileOptions::default();
        zip.start_file("mimetype", opts).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", opts).unwrap();
        zip.write_all(CONTAINER.as_bytes()).unwrap();
        zip.start_file("OEBPS/content.opf", opts).unwrap();
        zip.write_all(OPF.as_bytes()).unwrap();
        zip.start_file("OEBPS/images/cover.jpg", opts).unwrap();
        zip.write_all(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn full_epub_pipeline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let epub = tmp.path().join("book.epub");
        let covers = tmp.path().join("covers");
        build_epub(&epub);

        let processed = process(&epub, &covers);
        assert_eq!(processed.outcome, Outcome::Complete);
        assert_eq!(processed.title, "The Test Book");
        assert_eq!(processed.author.as_deref(), Some("A. Author"));
        assert_eq!(processed.metadata.publisher.as_deref(), Some("Test Press"));
        assert_eq!(processed.metadata.isbn.as_deref(), Some("9781234567897"));
        assert_eq!(processed.metadata.chapter_count, Some(2));
        assert_eq!(processed.metadata.has_toc, Some(true));
        assert_eq!(processed.metadata.has_images, Some(true));

        let cover = processed.metadata.cover_path.as_deref().expect("cover extracted");
        assert!(cover.ends_with("book_cover.jpg"), "unexpected cover path {cover}");
        assert!(Path::new(cover).is_file());
        assert!(processed.preview.starts_with("A short description"));
    }

    #[test]
    fn non_zip_is_rejected_by_signature() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = tmp.path().join("fake.epub");
        fs::write(&fake, b"definitely not a zip").unwrap();
        let processed = process(&fake, tmp.path());
        assert!(processed.outcome.is_failed());
        assert!(processed.outcome.error().unwrap().contains("signature"));
    }

    #[test]
    fn isbn_extraction() {
        assert_eq!(
            find_isbn(&["urn:isbn:978-1-2345-6789-7".to_string()]),
            Some("9781234567897".to_string())
        );
        assert_eq!(
            find_isbn(&["9791234567890".to_string()]),
            Some("9791234567890".to_string())
        );
        assert_eq!(find_isbn(&["uuid:abc".to_string()]), None);
    }
}

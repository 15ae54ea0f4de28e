//! `[[title]]` link graph.
//!
//! Edges live only in the `page_links` relation — traversal is by query,
//! never by in-memory back-pointers. Every content change replaces the full
//! edge set sourced at that page, so the graph is always exactly the set of
//! occurrences in the current body.

use crate::error::AppResult;
use crate::types::PageLink;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::OnceLock;

fn wiki_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]\n]+)\]\]").expect("static regex"))
}

/// One occurrence in a body: inner text and byte offset of the `[[`.
pub fn scan_wiki_links(content: &str) -> Vec<(String, usize)> {
    wiki_link_re()
        .captures_iter(content)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let inner = cap.get(1)?.as_str().trim();
            if inner.is_empty() {
                return None;
            }
            Some((inner.to_string(), whole.start()))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDetail {
    pub link_text: String,
    pub target_page_id: Option<String>,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub links_found: usize,
    pub links_resolved: usize,
    pub broken_links: usize,
    pub details: Vec<LinkDetail>,
}

/// Re-derive the edge set for a page from its current content.
///
/// Titles resolve case-insensitively after trimming, within the same
/// library. Unresolved occurrences persist with a NULL target (broken
/// links) so they can heal when the target page appears.
pub async fn reparse_links(
    db: &SqlitePool,
    library_id: &str,
    page_id: &str,
    content: &str,
) -> AppResult<LinkReport> {
    let occurrences = scan_wiki_links(content);

    let mut details = Vec::with_capacity(occurrences.len());
    for (text, offset) in &occurrences {
        let target: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM pages
            WHERE library_id = ?
              AND deleted_at IS NULL
              AND title IS NOT NULL
              AND lower(trim(title)) = lower(?)
            LIMIT 1
            "#,
        )
        .bind(library_id)
        .bind(text.to_lowercase())
        .fetch_optional(db)
        .await?;

        details.push(LinkDetail {
            link_text: text.clone(),
            target_page_id: target.map(|t| t.0),
            position: *offset as i64,
        });
    }

    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM page_links WHERE source_page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;
    for detail in &details {
        sqlx::query(
            r#"
            INSERT INTO page_links (source_page_id, target_page_id, link_text, position)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(page_id)
        .bind(&detail.target_page_id)
        .bind(&detail.link_text)
        .bind(detail.position)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let resolved = details.iter().filter(|d| d.target_page_id.is_some()).count();
    Ok(LinkReport {
        links_found: details.len(),
        links_resolved: resolved,
        broken_links: details.len() - resolved,
        details,
    })
}

/// Resolved outgoing edges in occurrence order.
pub async fn forward_links(db: &SqlitePool, page_id: &str) -> AppResult<Vec<PageLink>> {
    let links = sqlx::query_as::<_, PageLink>(
        r#"
        SELECT source_page_id, target_page_id, link_text, position
        FROM page_links
        WHERE source_page_id = ? AND target_page_id IS NOT NULL
        ORDER BY position
        "#,
    )
    .bind(page_id)
    .fetch_all(db)
    .await?;
    Ok(links)
}

/// All outgoing edges (including broken) in occurrence order.
pub async fn all_links(db: &SqlitePool, page_id: &str) -> AppResult<Vec<PageLink>> {
    let links = sqlx::query_as::<_, PageLink>(
        r#"
        SELECT source_page_id, target_page_id, link_text, position
        FROM page_links
        WHERE source_page_id = ?
        ORDER BY position
        "#,
    )
    .bind(page_id)
    .fetch_all(db)
    .await?;
    Ok(links)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BacklinkEntry {
    pub source_page_id: String,
    pub source_title: Option<String>,
    pub link_text: String,
    pub position: i64,
}

/// Edges pointing at this page, joined with the source page title.
pub async fn backlinks(db: &SqlitePool, page_id: &str) -> AppResult<Vec<BacklinkEntry>> {
    let entries = sqlx::query_as::<_, BacklinkEntry>(
        r#"
        SELECT pl.source_page_id, p.title AS source_title, pl.link_text, pl.position
        FROM page_links pl
        JOIN pages p ON p.id = pl.source_page_id
        WHERE pl.target_page_id = ? AND p.deleted_at IS NULL
        ORDER BY p.title, pl.position
        "#,
    )
    .bind(page_id)
    .fetch_all(db)
    .await?;
    Ok(entries)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub total: i64,
    pub resolved: i64,
    pub broken: i64,
    /// resolved / total; 1.0 when there are no links at all.
    pub health: f64,
}

/// Library-wide link health.
pub async fn library_link_stats(db: &SqlitePool, library_id: &str) -> AppResult<LinkStats> {
    let (total, resolved): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(pl.target_page_id IS NOT NULL), 0)
        FROM page_links pl
        JOIN pages p ON p.id = pl.source_page_id
        WHERE p.library_id = ? AND p.deleted_at IS NULL
        "#,
    )
    .bind(library_id)
    .fetch_one(db)
    .await?;

    let health = if total == 0 { 1.0 } else { resolved as f64 / total as f64 };
    Ok(LinkStats { total, resolved, broken: total - resolved, health })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_occurrences_with_offsets() {
        let body = "Hello [[Todo]] and [[ Reading List ]]!";
        let found = scan_wiki_links(body);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], ("Todo".to_string(), 6));
        assert_eq!(found[1].0, "Reading List");
        assert_eq!(found[1].1, body.find("[[ Reading").unwrap());
    }

    #[test]
    fn newlines_and_empties_do_not_match() {
        assert!(scan_wiki_links("[[a\nb]]").is_empty());
        assert!(scan_wiki_links("[[ ]]").is_empty());
        assert!(scan_wiki_links("[single] [brackets]").is_empty());
    }

    #[test]
    fn repeated_links_are_separate_occurrences() {
        let found = scan_wiki_links("[[X]] then [[X]]");
        assert_eq!(found.len(), 2);
        assert_ne!(found[0].1, found[1].1);
    }
}

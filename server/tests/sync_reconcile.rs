//! Reconciler integration tests: filesystem ↔ database agreement.

mod helpers;

use folio_server::store::hash_bytes;
use folio_server::types::{PageType, ProcessingStatus};
use folio_server::{files, library, pages, sync, workspace};
use helpers::TestHarness;
use std::fs;

#[tokio::test]
async fn library_creation_lays_out_the_tree() {
    let h = TestHarness::new().await;
    let lib_dir = h.ctx.store.library_dir(&h.user.username, &h.library.slug);

    assert!(lib_dir.join("pages").is_dir());
    assert!(lib_dir.join("files").is_dir());
    assert!(lib_dir.join("files/covers").is_dir());
    assert!(lib_dir.join(".library-config.json").is_file());
}

#[tokio::test]
async fn disk_file_becomes_a_saved_page_row() {
    let h = TestHarness::new().await;
    fs::write(h.pages_dir().join("Inbox.md"), "Hello [[Todo]]").unwrap();

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.errors, 0);

    let all = pages::list_pages(&h.ctx.db, &h.library.id).await.unwrap();
    assert_eq!(all.len(), 1);
    let page = &all[0];
    assert_eq!(page.title.as_deref(), Some("Inbox"));
    assert_eq!(page.page_type, PageType::Saved);
    assert_eq!(page.content, "Hello [[Todo]]");
    assert_eq!(page.file_hash.as_deref(), Some(hash_bytes(b"Hello [[Todo]]").as_str()));
}

#[tokio::test]
async fn force_sync_is_idempotent() {
    let h = TestHarness::new().await;
    fs::write(h.pages_dir().join("One.md"), "first").unwrap();
    fs::write(h.pages_dir().join("Two.md"), "second").unwrap();

    let first = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(first.created, 2);

    let second = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.no_change, 2);
}

#[tokio::test]
async fn changed_bytes_update_the_row_and_links() {
    let h = TestHarness::new().await;
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Todo", "tasks")
        .await
        .unwrap();
    fs::write(h.pages_dir().join("Inbox.md"), "plain").unwrap();
    sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();

    // Out-of-band edit introduces a link.
    fs::write(h.pages_dir().join("Inbox.md"), "see [[Todo]]").unwrap();
    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.updated, 1);

    let all = pages::list_pages(&h.ctx.db, &h.library.id).await.unwrap();
    let inbox = all.iter().find(|p| p.title.as_deref() == Some("Inbox")).unwrap();
    assert_eq!(inbox.content, "see [[Todo]]");
    assert_eq!(inbox.file_hash.as_deref(), Some(hash_bytes(b"see [[Todo]]").as_str()));

    let links = folio_server::links::forward_links(&h.ctx.db, &inbox.id).await.unwrap();
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn missing_backing_file_soft_deletes_the_row() {
    let h = TestHarness::new().await;
    let page =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Gone", "body")
            .await
            .unwrap();
    fs::remove_file(h.pages_dir().join("Gone.md")).unwrap();

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(pages::get_page(&h.ctx.db, &page.id).await.is_err());

    // Idempotent: already-deleted rows are not removed again.
    let again = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(again.removed, 0);
}

#[tokio::test]
async fn unsaved_pages_survive_reconciliation() {
    let h = TestHarness::new().await;
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft = pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "draft body", None)
        .await
        .unwrap();

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.removed, 0);
    let still = pages::get_page(&h.ctx.db, &draft.id).await.unwrap();
    assert_eq!(still.page_type, PageType::Unsaved);
    assert_eq!(still.workspace_id.as_deref(), Some(ws.id.as_str()));
}

#[tokio::test]
async fn soft_deleted_page_is_not_resurrected_while_file_remains() {
    let h = TestHarness::new().await;
    let page =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Keep", "body")
            .await
            .unwrap();
    pages::soft_delete_page(&h.ctx.db, &page.id).await.unwrap();
    assert!(h.pages_dir().join("Keep.md").is_file(), "soft-delete leaves content bytes");

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.created, 0);
    assert!(pages::get_page(&h.ctx.db, &page.id).await.is_err());
}

#[tokio::test]
async fn saved_rows_and_backing_files_are_a_bijection_after_sync() {
    let h = TestHarness::new().await;
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Alpha", "a")
        .await
        .unwrap();
    fs::write(h.pages_dir().join("Beta.md"), "b").unwrap();

    sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();

    let rows = pages::list_pages(&h.ctx.db, &h.library.id).await.unwrap();
    let saved: Vec<_> = rows.iter().filter(|p| p.page_type == PageType::Saved).collect();
    assert_eq!(saved.len(), 2);
    for page in &saved {
        let rel = page.file_path.as_deref().unwrap();
        let abs = h.ctx.store.library_dir(&h.user.username, &h.library.slug).join(rel);
        assert!(abs.is_file(), "saved row without a backing file: {rel}");
        assert_eq!(
            page.file_hash.as_deref().unwrap(),
            hash_bytes(&fs::read(&abs).unwrap()),
            "row hash must equal the file hash"
        );
    }
}

#[tokio::test]
async fn binary_junk_under_pages_is_a_per_item_error() {
    let h = TestHarness::new().await;
    fs::write(h.pages_dir().join("ok.md"), "fine").unwrap();
    let mut junk = vec![0u8; 512];
    junk.extend_from_slice(b"still junk");
    fs::write(h.pages_dir().join("junk.md"), &junk).unwrap();

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.created, 1, "the good file still lands");
    assert_eq!(report.errors, 1);
    assert!(report
        .details
        .iter()
        .any(|d| d.name == "junk.md" && d.action == "failed"));
}

#[tokio::test]
async fn quota_overflow_during_sync_marks_the_file_row_failed() {
    let h = TestHarness::new().await;
    // 64 bytes of quota: the PDF below cannot fit.
    let tiny = library::create_user(&h.ctx.db, &h.ctx.store, "pauper", "password1", Some(64), false)
        .await
        .unwrap();
    let lib = library::create_library(&h.ctx.db, &h.ctx.store, &tiny, "docs").await.unwrap();

    let files_dir = h.ctx.store.files_dir("pauper", "docs");
    fs::write(files_dir.join("big.pdf"), vec![b'x'; 4096]).unwrap();

    sync::force_sync(&h.ctx.db, &h.ctx.store, &tiny, &lib).await.unwrap();

    let rows = files::list_files(&h.ctx.db, &lib.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].processing_status, ProcessingStatus::Failed);
    assert!(rows[0].processing_error.as_deref().unwrap().contains("quota"));
}

#[tokio::test]
async fn disk_pdf_gets_a_file_row_even_when_unparsable() {
    let h = TestHarness::new().await;
    fs::write(h.files_dir().join("broken.pdf"), b"not really a pdf").unwrap();

    let report = sync::force_sync(&h.ctx.db, &h.ctx.store, &h.user, &h.library).await.unwrap();
    assert_eq!(report.created, 1);

    let rows = files::list_files(&h.ctx.db, &h.library.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].file_name, "broken.pdf");
    assert_eq!(rows[0].processing_status, ProcessingStatus::Failed);
    assert!(rows[0].processing_error.is_some());
}

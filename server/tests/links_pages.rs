//! Page factories, link graph, and generation bridge integration tests.

mod helpers;

use folio_server::error::AppError;
use folio_server::store::DuplicateMode;
use folio_server::stream::StreamEvent;
use folio_server::types::PageType;
use folio_server::{files, library, links, pages, stream, workspace};
use helpers::TestHarness;
use std::fs;

#[tokio::test]
async fn saved_page_writes_exact_bytes() {
    let h = TestHarness::new().await;
    let body = "Hello [[Todo]]";
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Inbox", body)
        .await
        .unwrap();

    let on_disk = fs::read_to_string(h.pages_dir().join("Inbox.md")).unwrap();
    assert_eq!(on_disk, body);
}

#[tokio::test]
async fn broken_link_then_healed_backlink() {
    let h = TestHarness::new().await;
    let inbox =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Inbox", "Hello [[Todo]]")
            .await
            .unwrap();

    // No Todo page yet: one broken edge.
    let all = links::all_links(&h.ctx.db, &inbox.id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].link_text, "Todo");
    assert_eq!(all[0].target_page_id, None);

    let todo =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Todo", "tasks")
            .await
            .unwrap();

    // Any content update re-parses and heals the edge.
    let report = links::reparse_links(&h.ctx.db, &h.library.id, &inbox.id, "Hello [[Todo]]")
        .await
        .unwrap();
    assert_eq!(report.links_found, 1);
    assert_eq!(report.broken_links, 0);

    let back = links::backlinks(&h.ctx.db, &todo.id).await.unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].source_page_id, inbox.id);
    assert_eq!(back[0].link_text, "Todo");
}

#[tokio::test]
async fn title_resolution_is_case_insensitive_and_trimmed() {
    let h = TestHarness::new().await;
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Reading List", "books")
        .await
        .unwrap();
    let src = pages::create_saved(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        "Src",
        "see [[ reading list ]]",
    )
    .await
    .unwrap();

    let report = links::reparse_links(
        &h.ctx.db,
        &h.library.id,
        &src.id,
        "see [[ reading list ]]",
    )
    .await
    .unwrap();
    assert_eq!(report.links_resolved, 1);
}

#[tokio::test]
async fn edge_set_equals_occurrences_after_every_edit() {
    let h = TestHarness::new().await;
    let page =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Hub", "[[A]] [[B]]")
            .await
            .unwrap();
    assert_eq!(links::all_links(&h.ctx.db, &page.id).await.unwrap().len(), 2);

    pages::update_content(&h.ctx.db, &h.ctx.store, &h.user, &h.library, &page.id, "[[C]]")
        .await
        .unwrap();
    let after = links::all_links(&h.ctx.db, &page.id).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].link_text, "C");

    pages::update_content(&h.ctx.db, &h.ctx.store, &h.user, &h.library, &page.id, "no links")
        .await
        .unwrap();
    assert!(links::all_links(&h.ctx.db, &page.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_titles_conflict_case_insensitively() {
    let h = TestHarness::new().await;
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Notes", "x")
        .await
        .unwrap();
    let err = pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "notes", "y")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn unsaved_converts_to_saved_exactly_when_titled() {
    let h = TestHarness::new().await;
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft = pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "draft body", None)
        .await
        .unwrap();
    assert_eq!(draft.page_type, PageType::Unsaved);
    assert!(draft.title.is_none());
    assert_eq!(draft.workspace_id.as_deref(), Some(ws.id.as_str()));

    let saved = pages::convert_unsaved_to_saved(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        &draft.id,
        "Promoted",
    )
    .await
    .unwrap();
    assert_eq!(saved.page_type, PageType::Saved);
    assert_eq!(saved.title.as_deref(), Some("Promoted"));
    assert!(saved.workspace_id.is_none());
    assert_eq!(fs::read_to_string(h.pages_dir().join("Promoted.md")).unwrap(), "draft body");
}

#[tokio::test]
async fn titling_a_draft_through_rename_also_converts_it() {
    // The transition must fire on any title-setting path, not just the
    // dedicated convert call.
    let h = TestHarness::new().await;
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft =
        pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "draft body", None).await.unwrap();

    let renamed = pages::rename_page(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        &draft.id,
        "Titled Draft",
    )
    .await
    .unwrap();
    assert_eq!(renamed.page_type, PageType::Saved);
    assert_eq!(renamed.title.as_deref(), Some("Titled Draft"));
    assert!(renamed.workspace_id.is_none());
    assert_eq!(
        fs::read_to_string(h.pages_dir().join("Titled Draft.md")).unwrap(),
        "draft body"
    );

    // A colliding title through the same path still conflicts and leaves
    // the draft untouched.
    let other =
        pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "second", None).await.unwrap();
    let err = pages::rename_page(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        &other.id,
        "Titled Draft",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let still = pages::get_page(&h.ctx.db, &other.id).await.unwrap();
    assert_eq!(still.page_type, PageType::Unsaved);
    assert!(still.title.is_none());
}

#[tokio::test]
async fn conversion_conflicts_leave_the_draft_unsaved() {
    let h = TestHarness::new().await;
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, "Taken", "x")
        .await
        .unwrap();
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft =
        pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "draft", None).await.unwrap();

    let err = pages::convert_unsaved_to_saved(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        &draft.id,
        "Taken",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let still = pages::get_page(&h.ctx.db, &draft.id).await.unwrap();
    assert_eq!(still.page_type, PageType::Unsaved);
}

#[tokio::test]
async fn library_slug_collision_conflicts() {
    let h = TestHarness::new().await;
    // "My Notes!" sanitizes to "my-notes"; so does "my  notes".
    library::create_library(&h.ctx.db, &h.ctx.store, &h.user, "My Notes!").await.unwrap();
    let err = library::create_library(&h.ctx.db, &h.ctx.store, &h.user, "my  notes")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn renaming_onto_an_existing_slug_conflicts() {
    let h = TestHarness::new().await;
    let work = library::create_library(&h.ctx.db, &h.ctx.store, &h.user, "Work").await.unwrap();

    let err =
        library::rename_library(&h.ctx.db, &h.ctx.store, &h.user, &work.id, "Notes")
            .await
            .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "'Notes' collides with the harness library");

    let renamed =
        library::rename_library(&h.ctx.db, &h.ctx.store, &h.user, &work.id, "Deep Work")
            .await
            .unwrap();
    assert_eq!(renamed.slug, "deep-work");
    assert!(h.ctx.store.library_dir(&h.user.username, "deep-work").is_dir());
    assert!(!h.ctx.store.library_dir(&h.user.username, "work").exists());
}

#[tokio::test]
async fn upload_over_quota_writes_nothing() {
    let h = TestHarness::new().await;
    let tiny = library::create_user(&h.ctx.db, &h.ctx.store, "pauper", "password1", Some(16), false)
        .await
        .unwrap();
    let lib = library::create_library(&h.ctx.db, &h.ctx.store, &tiny, "docs").await.unwrap();

    let err = files::ingest_upload(
        &h.ctx.db,
        &h.ctx.store,
        &tiny,
        &lib,
        "big.pdf",
        &vec![b'x'; 1024],
        DuplicateMode::Rename,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded(_)));

    let files_dir = h.ctx.store.files_dir("pauper", "docs");
    assert!(
        fs::read_dir(&files_dir).unwrap().filter_map(|e| e.ok()).all(|e| {
            e.file_name().to_string_lossy().starts_with("covers")
        }),
        "no bytes may land under files/ on quota failure"
    );
    assert!(files::list_files(&h.ctx.db, &lib.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_extensions_are_rejected() {
    let h = TestHarness::new().await;
    let err = files::ingest_upload(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        "notes.docx",
        b"PK",
        DuplicateMode::Rename,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::UnsupportedFileType(_)));
}

// ---------------------------------------------------------------------------
// Generation bridge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generation_appends_chunks_and_finalizes() {
    let h = TestHarness::new().await;
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft = pages::create_unsaved(
        &h.ctx.db,
        &h.library,
        &ws.id,
        "",
        Some("model=demo temperature=0.7".to_string()),
    )
    .await
    .unwrap();

    let handle = stream::start_generation(&h.ctx, &draft.id).await.unwrap();
    // History + live receiver together observe the full sequence, with each
    // event in exactly one of the two.
    let (history, mut rx) = handle.subscribe();

    for chunk in ["Hello ", "world", "!"] {
        handle.push(chunk.to_string()).await.unwrap();
    }
    stream::finish_generation(&h.ctx, &draft.id).unwrap();
    drop(handle); // last input sender gone: the bridge finalizes

    // Drain events until complete.
    let mut seen = history;
    while !seen.iter().any(|e| matches!(e, StreamEvent::Complete { .. })) {
        match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            _ => break,
        }
    }

    let labels: Vec<&str> = seen
        .iter()
        .map(|e| match e {
            StreamEvent::Start => "start",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        })
        .collect();
    assert_eq!(labels, vec!["start", "chunk", "chunk", "chunk", "complete"]);

    match seen.last().unwrap() {
        StreamEvent::Complete { total } => assert_eq!(total, "Hello world!"),
        other => panic!("expected complete, got {other:?}"),
    }

    let page = pages::get_page(&h.ctx.db, &draft.id).await.unwrap();
    assert_eq!(page.content, "Hello world!");
    assert_eq!(page.page_type, PageType::Unsaved, "still a draft until titled");
}

#[tokio::test]
async fn abandoning_the_stream_keeps_the_accumulated_prefix() {
    let h = TestHarness::new().await;
    let ws = workspace::create_workspace(&h.ctx.db, &h.library.id, "drafts").await.unwrap();
    let draft =
        pages::create_unsaved(&h.ctx.db, &h.library, &ws.id, "", None).await.unwrap();

    let handle = stream::start_generation(&h.ctx, &draft.id).await.unwrap();
    let (_, mut rx) = handle.subscribe();
    handle.push("partial".to_string()).await.unwrap();

    // Caller walks away: every input sender drops.
    stream::finish_generation(&h.ctx, &draft.id).unwrap();
    drop(handle);

    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(StreamEvent::Complete { total })) => {
                assert_eq!(total, "partial");
                break;
            }
            Ok(Ok(_)) => continue,
            other => panic!("bridge never completed: {other:?}"),
        }
    }

    let page = pages::get_page(&h.ctx.db, &draft.id).await.unwrap();
    assert_eq!(page.content, "partial");
}

//! Workspace engine integration tests.
//!
//! The core invariant under test: within a workspace, positions always form
//! the contiguous run 0..n-1 with no duplicates, across both item kinds,
//! after any sequence of add/move/remove operations.

mod helpers;

use folio_server::error::AppError;
use folio_server::types::{ItemKind, WorkspaceEntry};
use folio_server::{files, pages, workspace};
use helpers::TestHarness;

// Smallest valid 1x1 PNG (8-bit grayscale).
const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00, 0x3A,
    0x7E, 0x9B, 0x55, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x62,
    0x00, 0x00, 0x00, 0x06, 0x00, 0x03, 0x36, 0x37, 0x7C, 0xA8, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

async fn make_page(h: &TestHarness, title: &str) -> String {
    pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &h.library, title, "body")
        .await
        .expect("page")
        .id
}

async fn make_file(h: &TestHarness, name: &str) -> String {
    files::ingest_upload(
        &h.ctx.db,
        &h.ctx.store,
        &h.user,
        &h.library,
        name,
        TINY_PNG,
        folio_server::store::DuplicateMode::Rename,
    )
    .await
    .expect("upload")
    .expect("not skipped")
    .id
}

async fn make_workspace(h: &TestHarness, title: &str) -> String {
    workspace::create_workspace(&h.ctx.db, &h.library.id, title).await.expect("workspace").id
}

fn assert_contiguous(items: &[WorkspaceEntry]) {
    let mut positions: Vec<i64> = items.iter().map(|i| i.position).collect();
    positions.sort_unstable();
    let expected: Vec<i64> = (0..items.len() as i64).collect();
    assert_eq!(positions, expected, "positions must be the contiguous run 0..n-1");
}

#[tokio::test]
async fn append_on_empty_workspace_lands_at_zero() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let page = make_page(&h, "A").await;

    let item = workspace::add_item(&h.ctx.db, &ws, &page, ItemKind::Page, None, None)
        .await
        .unwrap();
    assert_eq!(item.position, 0);
    assert_eq!(item.depth, 0);
}

#[tokio::test]
async fn insert_shifts_the_tail_up() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;
    let x = make_page(&h, "X").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, None, None).await.unwrap();
    let item = workspace::add_item(&h.ctx.db, &ws, &x, ItemKind::Page, Some(0), None)
        .await
        .unwrap();
    assert_eq!(item.position, 0);

    let items = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    let order: Vec<&str> = items.iter().map(|i| i.title.as_deref().unwrap()).collect();
    assert_eq!(order, vec!["X", "A", "B"]);
    assert_contiguous(&items);
}

#[tokio::test]
async fn insert_past_the_end_clamps_to_append() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    let item = workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, Some(99), None)
        .await
        .unwrap();
    assert_eq!(item.position, 1);
}

#[tokio::test]
async fn duplicate_membership_is_a_conflict() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    let err = workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn mixed_kind_move_and_remove_scenario() {
    // Pages [A@0, B@1] and file F@2; move F to 0 -> [F, A, B]; remove A -> [F@0, B@1]
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;
    let f = make_file(&h, "pic.png").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &f, ItemKind::File, None, None).await.unwrap();

    let moved = workspace::move_item(&h.ctx.db, &ws, &f, ItemKind::File, 0, None)
        .await
        .unwrap();
    assert_eq!(moved.position, 0);

    let items = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    let order: Vec<(&str, ItemKind)> = items
        .iter()
        .map(|i| (i.title.as_deref().unwrap(), i.item_kind))
        .collect();
    assert_eq!(
        order,
        vec![("pic.png", ItemKind::File), ("A", ItemKind::Page), ("B", ItemKind::Page)]
    );
    assert_contiguous(&items);

    let removed = workspace::remove_item(&h.ctx.db, &ws, &a, ItemKind::Page).await.unwrap();
    assert!(removed);

    let items = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].title.as_deref(), Some("pic.png"));
    assert_eq!(items[0].position, 0);
    assert_eq!(items[1].title.as_deref(), Some("B"));
    assert_eq!(items[1].position, 1);
}

#[tokio::test]
async fn move_to_current_position_is_a_noop_but_depth_applies() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, None, None).await.unwrap();

    let item = workspace::move_item(&h.ctx.db, &ws, &b, ItemKind::Page, 1, Some(2))
        .await
        .unwrap();
    assert_eq!(item.position, 1);
    assert_eq!(item.depth, 2);

    let items = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    assert_eq!(items[0].title.as_deref(), Some("A"));
    assert_contiguous(&items);
}

#[tokio::test]
async fn add_then_remove_restores_the_sequence() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;
    let c = make_page(&h, "C").await;
    let x = make_page(&h, "X").await;

    for id in [&a, &b, &c] {
        workspace::add_item(&h.ctx.db, &ws, id, ItemKind::Page, None, None).await.unwrap();
    }
    let before: Vec<(String, i64)> = workspace::list_items(&h.ctx.db, &ws)
        .await
        .unwrap()
        .into_iter()
        .map(|i| (i.item_id, i.position))
        .collect();

    workspace::add_item(&h.ctx.db, &ws, &x, ItemKind::Page, Some(1), None).await.unwrap();
    workspace::remove_item(&h.ctx.db, &ws, &x, ItemKind::Page).await.unwrap();

    let after: Vec<(String, i64)> = workspace::list_items(&h.ctx.db, &ws)
        .await
        .unwrap()
        .into_iter()
        .map(|i| (i.item_id, i.position))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn removing_an_absent_item_reports_false() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;

    let removed = workspace::remove_item(&h.ctx.db, &ws, &a, ItemKind::Page).await.unwrap();
    assert!(!removed);
}

#[tokio::test]
async fn ai_context_flag_is_ignored_for_files() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let p = make_page(&h, "P").await;
    let f = make_file(&h, "pic.png").await;

    workspace::add_item(&h.ctx.db, &ws, &p, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &f, ItemKind::File, None, None).await.unwrap();

    let update = workspace::FlagUpdate {
        is_in_ai_context: Some(true),
        is_collapsed: Some(true),
        depth: None,
    };
    let page_item =
        workspace::update_flags(&h.ctx.db, &ws, &p, ItemKind::Page, update.clone())
            .await
            .unwrap();
    assert!(page_item.is_in_ai_context);
    assert!(page_item.is_collapsed);

    let file_item = workspace::update_flags(&h.ctx.db, &ws, &f, ItemKind::File, update)
        .await
        .unwrap();
    assert!(!file_item.is_in_ai_context, "files never enter the AI context");
    assert!(file_item.is_collapsed);

    let context = workspace::ai_context_items(&h.ctx.db, &ws).await.unwrap();
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].title.as_deref(), Some("P"));
}

#[tokio::test]
async fn duplicate_copies_every_edge_verbatim() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;
    let f = make_file(&h, "pic.png").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, Some(1)).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &f, ItemKind::File, Some(0), None).await.unwrap();
    workspace::update_flags(
        &h.ctx.db,
        &ws,
        &a,
        ItemKind::Page,
        workspace::FlagUpdate { is_in_ai_context: Some(true), ..Default::default() },
    )
    .await
    .unwrap();

    let copy = workspace::duplicate(&h.ctx.db, &ws, "inbox copy").await.unwrap();
    assert_eq!(copy.library_id, h.library.id);

    let original = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    let copied = workspace::list_items(&h.ctx.db, &copy.id).await.unwrap();
    assert_eq!(original.len(), copied.len());
    for (o, c) in original.iter().zip(copied.iter()) {
        assert_eq!(o.item_id, c.item_id);
        assert_eq!(o.item_kind, c.item_kind);
        assert_eq!(o.position, c.position);
        assert_eq!(o.depth, c.depth);
        assert_eq!(o.is_in_ai_context, c.is_in_ai_context);
        assert_eq!(o.is_collapsed, c.is_collapsed);
    }
}

#[tokio::test]
async fn deleting_a_workspace_leaves_pages_intact() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();

    workspace::delete_workspace(&h.ctx.db, &ws).await.unwrap();
    assert!(workspace::get_workspace(&h.ctx.db, &ws).await.is_err());
    assert!(pages::get_page(&h.ctx.db, &a).await.is_ok());
}

#[tokio::test]
async fn cross_user_items_are_rejected() {
    let h = TestHarness::new().await;
    let (other, other_lib) = h.other_user().await;
    let ws = make_workspace(&h, "inbox").await;

    let foreign =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &other, &other_lib, "Theirs", "body")
            .await
            .unwrap();

    let err = workspace::add_item(&h.ctx.db, &ws, &foreign.id, ItemKind::Page, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn negative_depth_is_rejected() {
    let h = TestHarness::new().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;

    let err = workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, Some(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
}

#[tokio::test]
async fn concurrent_inserts_at_the_same_position_serialize() {
    // [A@0, B@1], then two tasks both inserting at position 1: afterwards
    // positions are {0,1,2,3}, A stays first, B lands last, and the two new
    // items occupy 1 and 2 in whichever order the writes serialized.
    let h = TestHarness::new_file_backed().await;
    let ws = make_workspace(&h, "inbox").await;
    let a = make_page(&h, "A").await;
    let b = make_page(&h, "B").await;
    let x = make_page(&h, "X").await;
    let y = make_file(&h, "pic.png").await;

    workspace::add_item(&h.ctx.db, &ws, &a, ItemKind::Page, None, None).await.unwrap();
    workspace::add_item(&h.ctx.db, &ws, &b, ItemKind::Page, None, None).await.unwrap();

    let (db1, ws1, x1) = (h.ctx.db.clone(), ws.clone(), x.clone());
    let t1 = tokio::spawn(async move {
        workspace::add_item(&db1, &ws1, &x1, ItemKind::Page, Some(1), None).await
    });
    let (db2, ws2, y2) = (h.ctx.db.clone(), ws.clone(), y.clone());
    let t2 = tokio::spawn(async move {
        workspace::add_item(&db2, &ws2, &y2, ItemKind::File, Some(1), None).await
    });
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    let items = workspace::list_items(&h.ctx.db, &ws).await.unwrap();
    assert_eq!(items.len(), 4);
    assert_contiguous(&items);
    assert_eq!(items[0].item_id, a);
    assert_eq!(items[3].item_id, b);
    let middle: Vec<&str> = items[1..3].iter().map(|i| i.item_id.as_str()).collect();
    assert!(middle.contains(&x.as_str()) && middle.contains(&y.as_str()));
}

#[tokio::test]
async fn same_user_cross_library_references_are_allowed() {
    let h = TestHarness::new().await;
    let second = folio_server::library::create_library(&h.ctx.db, &h.ctx.store, &h.user, "work")
        .await
        .unwrap();
    let page =
        pages::create_saved(&h.ctx.db, &h.ctx.store, &h.user, &second, "Elsewhere", "body")
            .await
            .unwrap();

    let ws = make_workspace(&h, "inbox").await;
    let item = workspace::add_item(&h.ctx.db, &ws, &page.id, ItemKind::Page, None, None)
        .await
        .unwrap();
    assert_eq!(item.position, 0);
}

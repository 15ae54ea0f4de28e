//! Generation bridge: chunked writes into an unsaved page's body.
//!
//! A bridge is a long-lived task per page with an input channel of text
//! chunks and a broadcast of events. Each chunk is appended to the body and
//! the running total persisted before the next chunk is accepted. Closing
//! the input — by the caller finishing or abandoning the stream — finalizes
//! with whatever has accumulated; there is no rollback. Cancellation is the
//! channel closing, never an exception.

use crate::error::{AppError, AppResult};
use crate::types::AppContext;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const CHUNK_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Start,
    Chunk { text: String, total: String },
    Complete { total: String },
    Error { message: String },
}

/// Shared handle to a live bridge. Cloning shares the same channels.
#[derive(Clone)]
pub struct GenerationHandle {
    input: mpsc::Sender<String>,
    events: broadcast::Sender<StreamEvent>,
    /// Everything emitted so far, replayed to late subscribers so the
    /// observed sequence is complete regardless of when they attach.
    history: std::sync::Arc<std::sync::Mutex<Vec<StreamEvent>>>,
}

impl GenerationHandle {
    /// Append one chunk. Fails once the bridge has finalized.
    pub async fn push(&self, text: String) -> AppResult<()> {
        self.input
            .send(text)
            .await
            .map_err(|_| AppError::conflict("generation already finalized"))
    }

    /// Past events plus a receiver for everything after them.
    pub fn subscribe(&self) -> (Vec<StreamEvent>, broadcast::Receiver<StreamEvent>) {
        // Lock before subscribing so no event lands in both or neither.
        let history = self.history.lock().expect("history lock poisoned");
        let rx = self.events.subscribe();
        (history.clone(), rx)
    }
}

/// Emitting half handed to the bridge task. Deliberately carries no input
/// sender — the task must observe the channel closing to finalize.
struct Emitter {
    events: broadcast::Sender<StreamEvent>,
    history: std::sync::Arc<std::sync::Mutex<Vec<StreamEvent>>>,
}

impl Emitter {
    fn emit(&self, event: StreamEvent) {
        self.history.lock().expect("history lock poisoned").push(event.clone());
        let _ = self.events.send(event);
    }
}

/// Start a bridge for a page. The caller has already verified the page is
/// an unsaved draft owned by the requester.
pub async fn start_generation(ctx: &AppContext, page_id: &str) -> AppResult<GenerationHandle> {
    if ctx.generations.contains_key(page_id) {
        return Err(AppError::conflict("generation already running for this page"));
    }

    let page = crate::pages::get_page(&ctx.db, page_id).await?;

    let (input_tx, input_rx) = mpsc::channel::<String>(CHUNK_BUFFER);
    let (event_tx, _) = broadcast::channel::<StreamEvent>(EVENT_BUFFER);

    let history = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let handle = GenerationHandle {
        input: input_tx,
        events: event_tx.clone(),
        history: history.clone(),
    };
    ctx.generations.insert(page_id.to_string(), handle.clone());

    let db = ctx.db.clone();
    let generations = ctx.generations.clone();
    let library_id = page.library_id.clone();
    let id = page_id.to_string();
    let initial = page.content;
    let emitter = Emitter { events: event_tx, history };

    tokio::spawn(async move {
        run_bridge(db, generations, library_id, id, initial, input_rx, emitter).await;
    });

    Ok(handle)
}

/// Finalize a bridge by closing its input. Events keep flowing until the
/// task emits `complete` and unregisters itself.
pub fn finish_generation(ctx: &AppContext, page_id: &str) -> AppResult<()> {
    match ctx.generations.remove(page_id) {
        // Dropping the last input sender closes the channel.
        Some(_) => Ok(()),
        None => Err(AppError::not_found("generation")),
    }
}

/// Fetch the live handle for chunk pushes and event subscriptions.
pub fn get_generation(ctx: &AppContext, page_id: &str) -> AppResult<GenerationHandle> {
    ctx.generations
        .get(page_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::not_found("generation"))
}

async fn run_bridge(
    db: SqlitePool,
    generations: std::sync::Arc<dashmap::DashMap<String, GenerationHandle>>,
    library_id: String,
    page_id: String,
    initial: String,
    mut input: mpsc::Receiver<String>,
    emitter: Emitter,
) {
    emitter.emit(StreamEvent::Start);
    let mut total = initial;

    while let Some(chunk) = input.recv().await {
        total.push_str(&chunk);
        if let Err(e) = persist_body(&db, &page_id, &total).await {
            warn!(page = %page_id, error = %e, "generation persist failed");
            emitter.emit(StreamEvent::Error { message: e.to_string() });
            generations.remove(&page_id);
            return;
        }
        emitter.emit(StreamEvent::Chunk { text: chunk, total: total.clone() });
    }

    // Input closed: finalize with the accumulated prefix.
    if let Err(e) = persist_body(&db, &page_id, &total).await {
        emitter.emit(StreamEvent::Error { message: e.to_string() });
    } else {
        let _ = crate::links::reparse_links(&db, &library_id, &page_id, &total).await;
        emitter.emit(StreamEvent::Complete { total: total.clone() });
    }
    generations.remove(&page_id);
    debug!(page = %page_id, bytes = total.len(), "generation finalized");
}

async fn persist_body(db: &SqlitePool, page_id: &str, body: &str) -> AppResult<()> {
    let preview: String = body.chars().take(crate::types::PREVIEW_CHARS).collect();
    sqlx::query(
        "UPDATE pages SET content = ?, content_preview = ?, word_count = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(body)
    .bind(preview)
    .bind(body.split_whitespace().count() as i64)
    .bind(Utc::now())
    .bind(page_id)
    .execute(db)
    .await?;
    Ok(())
}

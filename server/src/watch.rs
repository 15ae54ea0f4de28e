//! Filesystem watcher for the storage tree.
//!
//! Raw notify events are coalesced per path into logical operations: an add
//! followed by a change within the window becomes a single upsert, an add
//! followed by a remove cancels outright. A path flushes after 500 ms of
//! quiet, or unconditionally once it has been pending for 2 s. Each flushed
//! operation runs a single-path reconcile; failures are logged and retried
//! on the next event for that path.

use crate::sync;
use crate::types::AppContext;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE_MS: u64 = 500;

/// Hard upper bound: a path that keeps receiving events is flushed anyway.
const DEBOUNCE_MAX_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Upsert,
    Remove,
}

struct Pending {
    op: PendingOp,
    /// Whether this window started with a create (enables add+remove cancel).
    born_here: bool,
    first_seen: Instant,
    last_event: Instant,
}

/// Start watching the storage root. Returns the watcher handle (must be kept
/// alive — dropping it stops the watcher).
pub fn start_watcher(ctx: AppContext) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create file watcher");
            return None;
        }
    };

    let root = ctx.store.root().to_path_buf();
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        error!(root = %root.display(), error = %e, "failed to watch storage root");
        return None;
    }
    info!(root = %root.display(), "watching storage root");

    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        debounce_loop(rx, ctx, handle);
    });

    Some(watcher)
}

/// Collect raw events and flush coalesced operations after a quiet period.
fn debounce_loop(rx: mpsc::Receiver<Event>, ctx: AppContext, handle: tokio::runtime::Handle) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                let now = Instant::now();
                let op = match event.kind {
                    EventKind::Create(_) => Some((PendingOp::Upsert, true)),
                    EventKind::Modify(_) => Some((PendingOp::Upsert, false)),
                    EventKind::Remove(_) => Some((PendingOp::Remove, false)),
                    _ => None,
                };
                let Some((op, is_create)) = op else { continue };

                for path in event.paths {
                    match pending.get_mut(&path) {
                        Some(entry) => {
                            if op == PendingOp::Remove && entry.born_here {
                                // add then remove within the window: cancel
                                debug!(path = %path.display(), "coalesced create+remove, cancelled");
                                pending.remove(&path);
                            } else {
                                entry.op = op;
                                entry.last_event = now;
                            }
                        }
                        None => {
                            pending.insert(
                                path,
                                Pending {
                                    op,
                                    born_here: is_create,
                                    first_seen: now,
                                    last_event: now,
                                },
                            );
                        }
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if pending.is_empty() {
            continue;
        }

        let now = Instant::now();
        let quiet = Duration::from_millis(DEBOUNCE_MS);
        let cap = Duration::from_millis(DEBOUNCE_MAX_MS);
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, p)| now - p.last_event >= quiet || now - p.first_seen >= cap)
            .map(|(path, _)| path.clone())
            .collect();

        for path in ready {
            let Some(entry) = pending.remove(&path) else { continue };
            let removed = entry.op == PendingOp::Remove;
            let db = ctx.db.clone();
            let store = ctx.store.clone();

            let result =
                handle.block_on(async { sync::sync_path(&db, &store, &path, removed).await });
            if let Err(e) = result {
                // Next event for this path retries; forceSync also heals.
                warn!(path = %path.display(), error = %e, "watch reconcile failed");
            }
        }
    }
}

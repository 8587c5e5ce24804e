//! File watcher for incremental live re-indexing.
//!
//! Watches the library root so probe files edited outside the app keep the
//! index consistent: changed or created `.yaml`/`.yml` files are re-parsed
//! and upserted, deletions drop out of the indices. The watcher thread owns
//! the notify handle and re-points it whenever `reload` swaps the library
//! root, so a runtime templates-dir switch keeps live re-indexing working.

use crate::library::{is_probe_file, ProbeLibrary};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE_MS: u64 = 500;

/// Start the watcher thread over the library root. The thread runs for the
/// process lifetime and follows root changes made by `ProbeLibrary::reload`.
pub fn start_watcher(library: Arc<ProbeLibrary>) {
    std::thread::spawn(move || watch_loop(library));
}

fn watch_loop(library: Arc<ProbeLibrary>) {
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
            warn!(error = %e, "Failed to create file watcher");
            return;
        }
    };

    let mut root = library.root();
    match watcher.watch(&root, RecursiveMode::Recursive) {
        Ok(()) => info!(root = %root.display(), "Watching library for external edits"),
        Err(e) => warn!(root = %root.display(), error = %e, "Failed to watch library root"),
    }

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        // Follow a templates-dir switch: unwatch the stale root, watch the
        // new one, and drop events queued against the old tree.
        let current = library.root();
        if current != root {
            let _ = watcher.unwatch(&root);
            pending.clear();
            match watcher.watch(&current, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!(root = %current.display(), "Watcher moved to new library root");
                }
                Err(e) => {
                    warn!(root = %current.display(), error = %e,
                          "Failed to watch new library root");
                }
            }
            root = current;
        }

        match rx.recv_timeout(Duration::from_millis(DEBOUNCE_MS)) {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                );
                if relevant {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - Duration::from_millis(DEBOUNCE_MS);
                let ready: Vec<PathBuf> =
                    pending.iter().filter(|(_, t)| **t <= cutoff).map(|(p, _)| p.clone()).collect();
                if ready.is_empty() {
                    continue;
                }
                for path in &ready {
                    pending.remove(path);
                }
                process_changes(&ready, &library);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Apply a batch of changed paths to the library index.
fn process_changes(paths: &[PathBuf], library: &ProbeLibrary) {
    let root = library.root();
    let mut updated = 0usize;
    let mut removed = 0usize;

    for path in paths {
        if !path.starts_with(&root) || !is_probe_file(path) {
            continue;
        }
        // Our own atomic writes leave dot-prefixed temp names behind briefly.
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }

        if path.exists() {
            match library.reindex_file(path) {
                Ok(()) => updated += 1,
                Err(e) => {
                    debug!(file = %path.display(), error = %e, "Changed probe did not reindex");
                }
            }
        } else {
            library.remove_by_path(path);
            removed += 1;
        }
    }

    if updated > 0 || removed > 0 {
        info!(updated = updated, removed = removed, "Library updated from external edits");
    }
}

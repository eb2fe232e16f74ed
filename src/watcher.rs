//! File watcher - turns filesystem events under each provider root into
//! index invalidations.
//!
//! One debouncer thread per root forwards paths over a tokio channel. Existing
//! files are reported as updates; the index falls back to a full read when it
//! does not know the session yet, which covers newly created logs.

use crate::index::{ChangeType, FileChange, FileType, SessionIndexCache};
use crate::sessions::Provider;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Start watching every root and feed changes into `cache`. Runs until all watchers exit.
pub async fn run(cache: Arc<SessionIndexCache>, roots: Vec<(Provider, PathBuf)>, debounce: Duration) {
    info!("Starting session watcher (debounce: {}ms)", debounce.as_millis());

    // Use tokio mpsc channel - blocking_send works from std::thread
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(Provider, PathBuf)>(256);

    for (provider, root) in &roots {
        // Create directory if needed so watcher is always ready
        if !root.exists() {
            match std::fs::create_dir_all(root) {
                Ok(()) => info!("Created {} sessions directory: {}", provider, root.display()),
                Err(e) => {
                    warn!("Cannot create {}, skipping {} watcher: {}", root.display(), provider, e);
                    continue;
                }
            }
        }
        spawn_watcher(*provider, root.clone(), debounce, tx.clone());
    }
    drop(tx);

    while let Some((provider, path)) = rx.recv().await {
        let Some(root) = roots
            .iter()
            .find(|(p, root)| *p == provider && path.starts_with(root))
            .map(|(_, root)| root)
        else {
            continue;
        };
        if let Some(change) = classify(provider, root, &path) {
            debug!("{:?} {:?} {}", change.change_type, change.file_type, path.display());
            cache.handle_change(root, &change).await;
        }
    }
    warn!("Session watcher event loop exited");
}

fn spawn_watcher(
    provider: Provider,
    root: PathBuf,
    debounce: Duration,
    tx: tokio::sync::mpsc::Sender<(Provider, PathBuf)>,
) {
    std::thread::spawn(move || {
        let mut debouncer = match new_debouncer(debounce, move |res: Result<Vec<DebouncedEvent>, notify::Error>| {
            match res {
                Ok(events) => {
                    debug!("{} watcher received {} events", provider, events.len());
                    for event in events {
                        if let DebouncedEventKind::Any = event.kind {
                            if let Err(e) = tx.blocking_send((provider, event.path)) {
                                error!("Failed to send {} file event: {}", provider, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("{} file watcher error: {:?}", provider, e);
                }
            }
        }) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create {} file watcher: {}", provider, e);
                return;
            }
        };

        if let Err(e) = debouncer.watcher().watch(&root, RecursiveMode::Recursive) {
            error!("Failed to watch {} directory: {}", provider, e);
            return;
        }

        info!("Watching {} for {} changes", root.display(), provider);

        // Keep thread alive
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    });
}

/// Describe a changed path relative to its provider root.
pub fn classify(provider: Provider, root: &Path, path: &Path) -> Option<FileChange> {
    let relative_path = path.strip_prefix(root).ok()?.to_path_buf();
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }

    let is_subagent = path.components().any(|c| c.as_os_str() == "subagents");
    let file_type = if is_subagent {
        FileType::Agent
    } else if provider.session_id_from_path(path).is_some() {
        FileType::Session
    } else if provider == Provider::Claude {
        // agent-*.jsonl beside the parent session
        FileType::Agent
    } else {
        FileType::Other
    };

    let change_type = if path.exists() {
        ChangeType::Update
    } else {
        ChangeType::Delete
    };

    Some(FileChange {
        provider,
        file_type,
        change_type,
        relative_path,
    })
}

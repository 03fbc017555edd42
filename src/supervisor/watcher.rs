//! Debounced config file watching
//!
//! Editors rarely write a file once: saves arrive as bursts of create,
//! modify, and rename events, and some replace the file entirely. The
//! watcher therefore observes the config's parent directory, filters events
//! to the config path, and only signals a reload after a quiet window with
//! no further events.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// The quiet window that must elapse before a reload fires.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Start watching the config file.
///
/// Returns the reload trigger channel and the watcher itself; dropping the
/// watcher stops the stream.
pub fn watch(config_path: PathBuf) -> Result<(mpsc::Receiver<()>, RecommendedWatcher)> {
    let canonical = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.clone());
    let dir = canonical
        .parent()
        .map(|p| p.to_path_buf())
        .context("config path has no parent directory")?;

    let (raw_tx, mut raw_rx) = mpsc::channel::<()>(64);
    let watched = canonical.clone();

    // The notify callback runs on its own thread; blocking_send is the
    // supported bridge into the async side.
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else {
            return;
        };
        let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
        if relevant && event.paths.iter().any(|p| p == &watched) {
            let _ = raw_tx.blocking_send(());
        }
    })
    .context("failed to create file watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    tracing::info!(path = %canonical.display(), "watching config for changes");

    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(4);
    tokio::spawn(async move {
        while raw_rx.recv().await.is_some() {
            // Extend the window while events keep arriving.
            loop {
                match tokio::time::timeout(DEBOUNCE_WINDOW, raw_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            if trigger_tx.send(()).await.is_err() {
                return;
            }
        }
    });

    Ok((trigger_rx, watcher))
}

//! Stop sentinel watcher for a running portal.
//!
//! Watches the coordination directory with the `notify` crate. When the stop
//! sentinel appears, the sentinel is consumed and the portal's cancellation
//! token is cancelled, which ends the accept loop.

use std::path::Path;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::endpoint::{Endpoint, STOP_SENTINEL_NAME};

/// Watch for the stop sentinel until it shows up or `cancel` fires.
///
/// Stale sentinels must be cleared before this starts; any sentinel present
/// once the watch is registered counts as a fresh stop request.
pub async fn watch_stop_sentinel(endpoint: Endpoint, cancel: CancellationToken) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    let mut watcher = match notify::recommended_watcher(move |event| {
        // Channel closed means the watcher task is gone
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create stop sentinel watcher");
            return;
        }
    };

    let directory = endpoint.directory().to_path_buf();
    if let Err(e) = watcher.watch(&directory, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %directory.display(),
            error = %e,
            "failed to watch coordination directory"
        );
        return;
    }

    // Dropping the watcher silently stops event delivery.
    let _watcher = watcher;

    tracing::debug!(path = %directory.display(), "watching for stop sentinel");

    if endpoint.stop_sentinel_path().exists() {
        consume(&endpoint, &cancel).await;
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if is_stop_event(&event) {
                            consume(&endpoint, &cancel).await;
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watcher error");
                    }
                    None => {
                        tracing::debug!("stop watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("stop watcher cancelled");
                return;
            }
        }
    }
}

async fn consume(endpoint: &Endpoint, cancel: &CancellationToken) {
    tracing::info!(
        sentinel = %endpoint.stop_sentinel_path().display(),
        "stop requested"
    );
    if let Err(e) = endpoint.clear_stop_request().await {
        tracing::warn!(error = %e, "failed to remove stop sentinel");
    }
    cancel.cancel();
}

/// Matched by file name: watchers may report canonicalized directory paths.
fn is_stop_event(event: &notify::Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(Path::new(STOP_SENTINEL_NAME).as_os_str()))
}

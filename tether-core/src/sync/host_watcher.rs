//! Recursive watcher over the host working tree

use std::path::PathBuf;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::paths::host_relative;
use super::{PathChangeEvent, Source};
use crate::{Error, Result};

/// Buffer between the notify callback thread and the async loop
const NOTIFY_BUFFER: usize = 256;

/// Emits host path events into the shared queue
#[derive(Debug, Clone)]
pub struct HostWatcher {
    root: PathBuf,
}

impl HostWatcher {
    /// Watch `root`, which should be canonical so event paths strip cleanly
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run until cancellation
    ///
    /// Failing to set up the recursive watch is an error; watcher errors
    /// afterwards are logged and skipped.
    pub async fn run(
        &self,
        events: mpsc::Sender<PathChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (notify_tx, mut notify_rx) =
            mpsc::channel::<std::result::Result<Event, notify::Error>>(NOTIFY_BUFFER);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(format!("Failed to create host watcher: {}", e)))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                Error::Watch(format!("Failed to watch {}: {}", self.root.display(), e))
            })?;

        info!(root = %self.root.display(), "Watching host working tree");

        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = notify_rx.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
            };

            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Host watcher error: {}", e);
                    continue;
                }
            };

            if !is_content_change(&event.kind) {
                continue;
            }

            for path in &event.paths {
                let Some(rel) = host_relative(&self.root, path) else {
                    continue;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = events.send(PathChangeEvent::new(Source::Host, rel)) => {
                        if sent.is_err() {
                            debug!("Event queue closed, stopping host watcher");
                            return Ok(());
                        }
                    }
                }
            }
        }

        drop(watcher);
        Ok(())
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn next_path(rx: &mut mpsc::Receiver<PathChangeEvent>, want: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) if event.path == want => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    #[test]
    fn test_is_content_change() {
        use notify::event::{AccessKind, CreateKind, RemoveKind};
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(is_content_change(&EventKind::Remove(RemoveKind::Any)));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Any)));
    }

    #[tokio::test]
    async fn test_host_watcher_reports_relative_paths() {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let watcher = HostWatcher::new(root.clone());
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.run(tx, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(root.join(".git/index"), "ignored").unwrap();
        std::fs::create_dir_all(root.join("app/models")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(root.join("app/models/user.rb"), "class User; end\n").unwrap();

        assert!(next_path(&mut rx, "app/models/user.rb").await);

        cancel.cancel();
        task.await.unwrap().unwrap();
        while let Ok(event) = rx.try_recv() {
            assert!(!event.path.starts_with(".git"), "metadata leaked: {}", event.path);
        }
    }

    #[tokio::test]
    async fn test_host_watcher_missing_root_is_fatal() {
        let (tx, _rx) = mpsc::channel(1);
        let watcher = HostWatcher::new("/nonexistent/tether/root");
        let err = watcher.run(tx, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
    }
}

//! Git state watcher: raises the pending flag on host HEAD and ref changes

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SyncShared;
use crate::{Error, Result};

/// Watches the host git directory for commits, checkouts, resets and merges
#[derive(Debug)]
pub struct GitStateWatcher {
    git_dir: PathBuf,
    common_dir: PathBuf,
    shared: Arc<SyncShared>,
}

impl GitStateWatcher {
    pub fn new(
        git_dir: impl Into<PathBuf>,
        common_dir: impl Into<PathBuf>,
        shared: Arc<SyncShared>,
    ) -> Self {
        Self {
            git_dir: git_dir.into(),
            common_dir: common_dir.into(),
            shared,
        }
    }

    /// Whether a changed path is one git rewrites on every HEAD movement
    fn is_state_path(&self, path: &Path) -> bool {
        if path.extension().is_some_and(|ext| ext == "lock") {
            return false;
        }
        path == self.git_dir.join("HEAD")
            || path == self.git_dir.join("logs").join("HEAD")
            || path == self.common_dir.join("packed-refs")
            || path.starts_with(self.common_dir.join("refs").join("heads"))
    }

    /// Run until cancellation, poking `trigger` after every state change
    ///
    /// The pending flag goes up before the trigger is sent.
    pub async fn run(&self, trigger: mpsc::Sender<()>, cancel: CancellationToken) -> Result<()> {
        let (notify_tx, mut notify_rx) =
            mpsc::channel::<std::result::Result<Event, notify::Error>>(64);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.blocking_send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(format!("Failed to create git state watcher: {}", e)))?;

        let targets = [
            (self.git_dir.clone(), RecursiveMode::NonRecursive),
            (self.git_dir.join("logs"), RecursiveMode::NonRecursive),
            (self.common_dir.clone(), RecursiveMode::NonRecursive),
            (self.common_dir.join("refs").join("heads"), RecursiveMode::Recursive),
        ];
        for (dir, mode) in &targets {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "Skipping missing git directory");
                continue;
            }
            watcher
                .watch(dir, *mode)
                .map_err(|e| Error::Watch(format!("Failed to watch {}: {}", dir.display(), e)))?;
        }

        info!(git_dir = %self.git_dir.display(), "Watching host git state");

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
                    warn!("Git state watcher error: {}", e);
                    continue;
                }
            };

            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            if !event.paths.iter().any(|p| self.is_state_path(p)) {
                continue;
            }

            debug!(paths = ?event.paths, "Git state changed");
            self.shared.mark_git_pending();
            // A full slot already guarantees a sync pass
            let _ = trigger.try_send(());
        }

        drop(watcher);
        Ok(())
    }
}

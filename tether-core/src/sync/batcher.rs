//! Event batcher: debounces path events and drives flushes

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::reconciler::ContentReconciler;
use super::state::{QueuedPaths, SyncShared};
use super::translator::translate;
use super::{PathChangeEvent, Source};
use crate::config::SyncConfig;
use crate::git::{HostTree, RemoteTree, StatusScope, WorkTree};
use crate::{Error, Result};

/// Result of one flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flushed {
    /// Ran, was discarded, or had nothing to do
    Done,
    /// File sync is paused; the paths stay queued
    Deferred,
}

/// An open debounce window
#[derive(Debug, Clone, Copy)]
struct Window {
    /// When the first path of the window was queued
    opened: Instant,
    deadline: Instant,
}

/// Single consumer of the shared event queue
#[derive(Debug)]
pub struct EventBatcher {
    host: HostTree,
    remote: RemoteTree,
    reconciler: ContentReconciler,
    shared: Arc<SyncShared>,
    config: SyncConfig,
}

impl EventBatcher {
    pub fn new(
        host: HostTree,
        remote: RemoteTree,
        shared: Arc<SyncShared>,
        config: SyncConfig,
    ) -> Self {
        let reconciler = ContentReconciler::new(host.clone(), remote.clone(), Arc::clone(&shared));
        Self {
            host,
            remote,
            reconciler,
            shared,
            config,
        }
    }

    /// Drain `events` until cancellation
    ///
    /// The debounce deadline restarts on every event but never lands later
    /// than `max_wait` after the first queued path. The idle ticker keeps
    /// announcing idleness while nothing is queued, drops queued paths while
    /// a git sync is pending, and schedules a flush when only retries are
    /// outstanding.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<PathChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut window: Option<Window> = None;
        let mut ticker = tokio::time::interval(self.config.idle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = window.as_ref().map(|w| w.deadline);
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    match self.flush(&cancel).await {
                        Ok(Flushed::Done) => window = None,
                        Ok(Flushed::Deferred) => window = Some(self.open_window()),
                        Err(_) if cancel.is_cancelled() => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }

                _ = ticker.tick() => {
                    if self.shared.git_pending() {
                        self.discard_pending();
                        window = None;
                    } else if window.is_none() {
                        if self.shared.retries().is_empty() {
                            self.shared.idle().signal();
                        } else {
                            window = Some(self.open_window());
                        }
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Event queue closed");
                        return Ok(());
                    };
                    self.shared.queued().insert(event);
                    window = Some(match window {
                        Some(open) => self.extend_window(open),
                        None => self.open_window(),
                    });
                }
            }
        }
    }

    fn open_window(&self) -> Window {
        let opened = Instant::now();
        Window {
            opened,
            deadline: opened + self.config.debounce,
        }
    }

    fn extend_window(&self, window: Window) -> Window {
        let cap = window.opened + self.config.max_wait;
        Window {
            opened: window.opened,
            deadline: (Instant::now() + self.config.debounce).min(cap),
        }
    }

    /// Drop queued paths superseded by the pending git sync
    fn discard_pending(&self) {
        let dropped = self.shared.take_queued().len();
        if dropped > 0 {
            debug!(dropped, "Git sync pending, discarding queued paths");
        }
        self.shared.idle().signal();
    }

    async fn flush(&self, cancel: &CancellationToken) -> Result<Flushed> {
        if self.shared.git_pending() {
            self.discard_pending();
            return Ok(Flushed::Done);
        }

        let Some(_gate) = self.shared.try_begin_flush() else {
            debug!("File sync paused, holding queued paths");
            return Ok(Flushed::Deferred);
        };

        let mut batch = self.shared.take_queued();
        let retrying: HashSet<(Source, String)> = self
            .shared
            .retries()
            .snapshot()
            .into_iter()
            .map(|entry| (entry.source, entry.path))
            .collect();
        for (source, path) in &retrying {
            batch.add(*source, path.clone());
        }

        if !batch.is_empty() {
            let flush_cancel = cancel.child_token();
            let paths = batch.len();
            let outcome = tokio::time::timeout(
                self.config.flush_timeout,
                self.flush_batches(&batch, &retrying, &flush_cancel),
            )
            .await;

            match outcome {
                Ok(result) => result?,
                Err(_) => {
                    flush_cancel.cancel();
                    warn!(
                        paths,
                        "Flush exceeded {:?}, abandoning this cycle",
                        self.config.flush_timeout
                    );
                }
            }
        }

        self.shared.idle().signal();
        Ok(Flushed::Done)
    }

    async fn flush_batches(
        &self,
        batch: &QueuedPaths,
        retrying: &HashSet<(Source, String)>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sides: [(Source, &dyn WorkTree, &dyn WorkTree, Vec<String>); 2] = [
            (Source::Host, &self.host, &self.remote, batch.host.iter().cloned().collect()),
            (Source::Remote, &self.remote, &self.host, batch.remote.iter().cloned().collect()),
        ];

        for (source, from, to, paths) in sides {
            if paths.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let records = translate(from, to, StatusScope::Paths(&paths), cancel).await?;

            // Retried paths that no longer translate to a change are settled
            let mentioned: HashSet<&str> = records
                .iter()
                .flat_map(|r| std::iter::once(r.path.as_str()).chain(r.old_path.as_deref()))
                .collect();
            for (retry_source, path) in retrying {
                if *retry_source == source && !mentioned.contains(path.as_str()) {
                    self.shared.retries().resolve(path, source);
                }
            }

            let stats = self.reconciler.apply(source, &records, cancel).await?;
            debug!(
                source = %source,
                candidates = paths.len(),
                records = records.len(),
                updated = stats.updated,
                removed = stats.removed,
                retried = stats.retried,
                "Flushed batch"
            );
        }

        Ok(())
    }
}

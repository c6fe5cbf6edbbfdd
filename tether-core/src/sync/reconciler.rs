//! Content reconciler: applies change records to the opposite side

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SyncShared;
use super::{ChangeKind, ChangeRecord, Source};
use crate::git::{HostTree, RemoteTree, WorkTree};
use crate::{Error, Result};

/// A path whose last reconcile attempt failed transiently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Normalized root-relative path
    pub path: String,
    /// Side the change originated on
    pub source: Source,
    /// Failed attempts so far
    pub attempts: u32,
}

/// Retry bookkeeping keyed by source and path
#[derive(Debug)]
pub struct RetryQueue {
    max_attempts: u32,
    entries: Mutex<HashMap<(Source, String), u32>>,
}

impl RetryQueue {
    /// Create an empty queue that gives up after `max_attempts` failures
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Source, String), u32>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a failed attempt
    ///
    /// Returns the attempt number if the path stays queued, or `None` once the
    /// ceiling is reached and the path has been dropped.
    pub fn record_failure(&self, path: &str, source: Source) -> Option<u32> {
        let mut entries = self.lock();
        let key = (source, path.to_string());
        let attempts = entries.get(&key).copied().unwrap_or(0) + 1;
        if attempts >= self.max_attempts {
            entries.remove(&key);
            warn!(
                "{}: giving up on {} after {} attempts",
                source.direction(),
                path,
                attempts
            );
            None
        } else {
            entries.insert(key, attempts);
            Some(attempts)
        }
    }

    /// Forget a path after it reconciled cleanly
    pub fn resolve(&self, path: &str, source: Source) {
        self.lock().remove(&(source, path.to_string()));
    }

    /// Copy of the current entries, sorted by source and path
    pub fn snapshot(&self) -> Vec<RetryEntry> {
        let mut entries: Vec<RetryEntry> = self
            .lock()
            .iter()
            .map(|((source, path), attempts)| RetryEntry {
                path: path.clone(),
                source: *source,
                attempts: *attempts,
            })
            .collect();
        entries.sort_by(|a, b| (a.source, &a.path).cmp(&(b.source, &b.path)));
        entries
    }

    /// Attempts recorded for a path
    pub fn attempts(&self, path: &str, source: Source) -> u32 {
        self.lock()
            .get(&(source, path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every entry; returns how many there were
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

/// Tally of one reconcile batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Files copied to the opposite side
    pub updated: usize,
    /// Paths removed on the opposite side
    pub removed: usize,
    /// Records that needed no work
    pub unchanged: usize,
    /// Records whose source vanished before they could be applied
    pub skipped: usize,
    /// Records requeued after a transient failure
    pub retried: usize,
    /// Records dropped after reaching the retry ceiling
    pub abandoned: usize,
}

impl ReconcileStats {
    /// Number of copy and delete operations performed
    pub fn operations(&self) -> usize {
        self.updated + self.removed
    }

    fn absorb(&mut self, other: ReconcileStats) {
        self.updated += other.updated;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
    }
}

enum Applied {
    Updated,
    Removed,
    Unchanged,
    Vanished,
}

/// Makes the opposite side match the originating side, record by record
#[derive(Debug, Clone)]
pub struct ContentReconciler {
    host: HostTree,
    remote: RemoteTree,
    shared: Arc<SyncShared>,
}

impl ContentReconciler {
    pub fn new(host: HostTree, remote: RemoteTree, shared: Arc<SyncShared>) -> Self {
        Self {
            host,
            remote,
            shared,
        }
    }

    /// Apply `records` originating on `source`
    ///
    /// Stops early, without error, if a git sync becomes pending mid-batch.
    /// Transient failures are requeued; any other failure aborts the batch.
    pub async fn apply(
        &self,
        source: Source,
        records: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        for (done, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.shared.git_pending() {
                debug!(
                    remaining = records.len() - done,
                    "Git sync pending, abandoning {} batch",
                    source
                );
                break;
            }
            stats.absorb(self.apply_record(source, record, cancel).await?);
        }

        Ok(stats)
    }

    async fn apply_record(
        &self,
        source: Source,
        record: &ChangeRecord,
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        let mut steps: Vec<(&str, ChangeKind)> = Vec::with_capacity(2);
        match record.kind {
            ChangeKind::Delete => steps.push((record.path.as_str(), ChangeKind::Delete)),
            ChangeKind::Modify => steps.push((record.path.as_str(), ChangeKind::Modify)),
            ChangeKind::Rename => {
                if let Some(old) = record.old_path.as_deref() {
                    steps.push((old, ChangeKind::Delete));
                }
                steps.push((record.path.as_str(), ChangeKind::Modify));
            }
        }

        for (path, kind) in steps {
            let outcome = match kind {
                ChangeKind::Delete => self.remove_opposite(source, path, cancel).await,
                _ => self.copy_across(source, path, cancel).await,
            };

            match outcome {
                Ok(applied) => {
                    self.shared.retries().resolve(path, source);
                    match applied {
                        Applied::Updated => stats.updated += 1,
                        Applied::Removed => stats.removed += 1,
                        Applied::Unchanged => stats.unchanged += 1,
                        Applied::Vanished => stats.skipped += 1,
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_not_found() => {
                    debug!("{}: {} vanished before it could be applied", source.direction(), path);
                    self.shared.retries().resolve(path, source);
                    stats.skipped += 1;
                }
                Err(e) if e.is_transient() => {
                    match self.shared.retries().record_failure(path, source) {
                        Some(attempt) => {
                            debug!(
                                attempt,
                                error = %e,
                                "{}: will retry {}",
                                source.direction(),
                                path
                            );
                            stats.retried += 1;
                        }
                        None => stats.abandoned += 1,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(stats)
    }

    async fn copy_across(
        &self,
        source: Source,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let host_hash = self.host.blob_hash(path, cancel).await?;
        let remote_hash = self.remote.blob_hash(path, cancel).await?;

        let source_hash = match source {
            Source::Host => &host_hash,
            Source::Remote => &remote_hash,
        };
        if source_hash.is_none() {
            return Ok(Applied::Vanished);
        }
        if host_hash == remote_hash {
            return Ok(Applied::Unchanged);
        }

        let bridge = self.remote.bridge();
        let environment = self.remote.environment();
        match source {
            Source::Host => {
                self.remote.ensure_parent(path, cancel).await?;
                bridge
                    .copy_to_remote(
                        environment,
                        &self.host.abs(path),
                        &self.remote.abs(path),
                        false,
                        cancel,
                    )
                    .await?;
                if let Some(mode) = self.host.file_mode(path)? {
                    self.remote.chmod(path, mode, cancel).await?;
                }
            }
            Source::Remote => {
                let target = self.host.abs(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                bridge
                    .copy_from_remote(environment, &self.remote.abs(path), &target, cancel)
                    .await?;
            }
        }

        info!("{}: updated {}", source.direction(), path);
        Ok(Applied::Updated)
    }

    async fn remove_opposite(
        &self,
        source: Source,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Applied> {
        let removed = match source {
            Source::Host => self.remote.remove(path, cancel).await?,
            Source::Remote => self.host.remove(path, cancel).await?,
        };

        if removed {
            info!("{}: removed {}", source.direction(), path);
            Ok(Applied::Removed)
        } else {
            Ok(Applied::Unchanged)
        }
    }
}

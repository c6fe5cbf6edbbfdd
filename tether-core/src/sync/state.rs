//! State shared between the engine's loops

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use super::idle::IdleSignal;
use super::reconciler::RetryQueue;
use super::{PathChangeEvent, Source};

/// Paths accumulated by the batcher since its last flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueuedPaths {
    /// Changed on the host
    pub host: BTreeSet<String>,
    /// Changed in the remote environment
    pub remote: BTreeSet<String>,
}

impl QueuedPaths {
    /// Record an event, deduplicating by path
    pub fn insert(&mut self, event: PathChangeEvent) {
        match event.source {
            Source::Host => self.host.insert(event.path),
            Source::Remote => self.remote.insert(event.path),
        };
    }

    /// Add a path for a source
    pub fn add(&mut self, source: Source, path: String) {
        self.insert(PathChangeEvent { source, path });
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.remote.is_empty()
    }

    /// Total queued paths
    pub fn len(&self) -> usize {
        self.host.len() + self.remote.len()
    }
}

/// Synchronization primitives shared by every loop of one session
///
/// - `git_pending` is set by the git state watcher and cleared by the git
///   syncer; the batcher and reconciler only read it.
/// - the flush gate is held by the batcher for each flush and by the git
///   syncer while it has file sync paused.
#[derive(Debug)]
pub struct SyncShared {
    git_pending: AtomicBool,
    idle: IdleSignal,
    retries: RetryQueue,
    queued: Mutex<QueuedPaths>,
    flush_gate: AsyncMutex<()>,
}

impl SyncShared {
    /// Fresh state with the given retry ceiling
    pub fn new(max_attempts: u32) -> Self {
        Self {
            git_pending: AtomicBool::new(false),
            idle: IdleSignal::new(),
            retries: RetryQueue::new(max_attempts),
            queued: Mutex::new(QueuedPaths::default()),
            flush_gate: AsyncMutex::new(()),
        }
    }

    /// Whether a git-state transition is waiting to be reconciled
    pub fn git_pending(&self) -> bool {
        self.git_pending.load(Ordering::Acquire)
    }

    /// Raise the pending flag
    pub fn mark_git_pending(&self) {
        self.git_pending.store(true, Ordering::Release);
    }

    /// Lower the pending flag
    pub fn clear_git_pending(&self) {
        self.git_pending.store(false, Ordering::Release);
    }

    /// Idle handshake
    pub fn idle(&self) -> &IdleSignal {
        &self.idle
    }

    /// Paths awaiting another attempt
    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    /// Lock the batcher's accumulated paths
    pub fn queued(&self) -> MutexGuard<'_, QueuedPaths> {
        // A poisoned lock only means a panicking holder; the set is still usable
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take everything accumulated so far
    pub fn take_queued(&self) -> QueuedPaths {
        std::mem::take(&mut *self.queued())
    }

    /// Drop accumulated paths and retry entries; returns how many were dropped
    pub fn discard_pending_work(&self) -> usize {
        let dropped = self.take_queued().len();
        dropped + self.retries.clear()
    }

    /// Pause file sync until the returned guard is dropped
    ///
    /// Waits for an in-flight flush to finish.
    pub async fn pause_file_sync(&self) -> AsyncMutexGuard<'_, ()> {
        self.flush_gate.lock().await
    }

    /// Enter a flush unless file sync is paused
    pub fn try_begin_flush(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        self.flush_gate.try_lock().ok()
    }
}

//! Bidirectional sync engine
//!
//! Five loops run concurrently for one session:
//! - host watcher and remote watcher feed path events into one bounded queue
//! - the batcher debounces them and flushes through the status translator and
//!   the content reconciler
//! - the git state watcher raises the shared pending flag on commits,
//!   checkouts and resets
//! - the git syncer replicates host history into the remote with a bundle
//!
//! Git-level reconciliation always wins over file-level reconciliation: while
//! the pending flag is up the batcher drops what it has accumulated.

mod batcher;
mod engine;
mod git_syncer;
mod git_watcher;
mod host_watcher;
mod idle;
pub mod paths;
mod reconciler;
mod remote_watcher;
mod state;
mod translator;

pub use batcher::EventBatcher;
pub use engine::SyncEngine;
pub use git_syncer::{GitSyncOutcome, GitSyncState, GitSyncer};
pub use git_watcher::GitStateWatcher;
pub use host_watcher::HostWatcher;
pub use idle::IdleSignal;
pub use reconciler::{ContentReconciler, ReconcileStats, RetryEntry, RetryQueue};
pub use remote_watcher::{parse_watch_line, RemoteWatcher, WatchEventKind};
pub use state::{QueuedPaths, SyncShared};
pub use translator::translate;

/// Which working tree an event or change originated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    /// The local working tree
    Host,
    /// The working tree inside the remote environment
    Remote,
}

impl Source {
    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            Self::Host => Self::Remote,
            Self::Remote => Self::Host,
        }
    }

    /// Direction label used in activity logs
    pub fn direction(self) -> &'static str {
        match self {
            Self::Host => "host → remote",
            Self::Remote => "remote → host",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A watcher observed something happen at a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChangeEvent {
    /// Side the change happened on
    pub source: Source,
    /// Normalized root-relative path
    pub path: String,
}

impl PathChangeEvent {
    /// Create an event
    pub fn new(source: Source, path: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }
}

/// Kind of change derived from git status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    /// Removed on the source side
    Delete,
    /// Moved from `old_path`
    Rename,
    /// Created or changed on the source side
    Modify,
}

/// One git-aware change to push to the opposite side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// What happened
    pub kind: ChangeKind,
    /// Normalized root-relative path
    pub path: String,
    /// Previous path, for renames
    pub old_path: Option<String>,
}

impl ChangeRecord {
    /// A created or changed file
    pub fn modify(path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Modify,
            path: path.into(),
            old_path: None,
        }
    }

    /// A removed path
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            path: path.into(),
            old_path: None,
        }
    }

    /// A moved file
    pub fn rename(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Rename,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_direction() {
        assert_eq!(Source::Host.direction(), "host → remote");
        assert_eq!(Source::Remote.direction(), "remote → host");
        assert_eq!(Source::Host.opposite(), Source::Remote);
        assert_eq!(Source::Remote.to_string(), "remote");
    }

    #[test]
    fn test_change_kind_order_puts_deletes_first() {
        let mut kinds = vec![ChangeKind::Modify, ChangeKind::Rename, ChangeKind::Delete];
        kinds.sort();
        assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Rename, ChangeKind::Modify]);
    }
}

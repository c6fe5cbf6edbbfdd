//! Git syncer: replicates host history into the remote repository
//!
//! One pass waits for the batcher to go idle, pauses file sync, stashes the
//! remote's uncommitted changes on the host, ships the missing commits as a
//! bundle, forces the remote HEAD onto the host commit and puts the stashed
//! changes back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::SyncShared;
use super::translator::translate;
use super::{ChangeKind, ChangeRecord, Source};
use crate::config::SyncConfig;
use crate::git::{HeadState, HostTree, RemoteTree, StatusScope, WorkTree};
use crate::{Error, Result};

/// Distinguishes bundle files of concurrent passes in one process
static BUNDLE_SEQ: AtomicU64 = AtomicU64::new(0);

/// HEAD on both sides at the start of a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSyncState {
    pub host_sha: String,
    pub host_branch: String,
    pub remote_sha: Option<String>,
    pub remote_branch: String,
}

impl GitSyncState {
    fn from_heads(host: HeadState, remote: HeadState) -> Result<Self> {
        let host_sha = host.sha.ok_or_else(|| {
            Error::Sync(format!(
                "Host branch '{}' has no commits; commit once before starting sync",
                host.branch
            ))
        })?;
        Ok(Self {
            host_sha,
            host_branch: host.branch,
            remote_sha: remote.sha,
            remote_branch: remote.branch,
        })
    }

    /// Same commit and same branch on both sides
    pub fn is_converged(&self) -> bool {
        self.remote_sha.as_deref() == Some(self.host_sha.as_str())
            && self.host_branch == self.remote_branch
    }

    fn host_detached(&self) -> bool {
        self.host_branch == crate::git::DETACHED
    }
}

/// What a pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitSyncOutcome {
    /// Both sides already matched
    InSync,
    /// Remote moved onto the host commit
    Aligned {
        /// Commits shipped in the bundle (0 when only the pointer moved)
        commits: u64,
    },
    /// Remote HEAD is unknown to the host; nothing was changed
    RemoteAhead {
        remote_sha: String,
    },
}

enum Stashed {
    /// Copied into the stash directory under the same relative path
    File(String),
    /// Absent on the remote
    Removed(String),
}

/// Remote working-tree changes parked on the host during a pass
///
/// Lives under the host git directory so it can be kept when the remote
/// was reset but the changes could not be put back.
struct Snapshot {
    dir: TempDir,
    entries: Vec<Stashed>,
}

impl Snapshot {
    /// Keep the stashed files on disk and report where they are
    fn preserve(self, error: &Error) {
        if self.entries.is_empty() {
            return;
        }
        let entries = self.entries.len();
        let kept = self.dir.keep();
        warn!(
            entries,
            "Remote working-tree changes were not restored ({}); copies kept in {}",
            error,
            kept.display()
        );
    }
}

/// Consumer of git state triggers
#[derive(Debug)]
pub struct GitSyncer {
    host: HostTree,
    remote: RemoteTree,
    shared: Arc<SyncShared>,
    config: SyncConfig,
}

impl GitSyncer {
    pub fn new(
        host: HostTree,
        remote: RemoteTree,
        shared: Arc<SyncShared>,
        config: SyncConfig,
    ) -> Self {
        Self {
            host,
            remote,
            shared,
            config,
        }
    }

    /// Run one pass per debounced burst of triggers until cancellation
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                t = triggers.recv() => if t.is_none() { return Ok(()) },
            }

            // Swallow the rest of the burst
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.git_debounce) => break,
                    t = triggers.recv() => if t.is_none() { break },
                }
            }

            self.shared.mark_git_pending();
            match self.sync_once(&cancel).await {
                Ok(outcome) => debug!(?outcome, "Git sync pass finished"),
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one reconciliation pass now
    ///
    /// Clears the pending flag and resumes file sync on every exit path.
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<GitSyncOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.shared.idle().wait() => {}
        }

        let paused = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.shared.pause_file_sync() => guard,
        };

        let result = self.reconcile(cancel).await;
        self.shared.clear_git_pending();
        drop(paused);
        result
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> Result<GitSyncOutcome> {
        let snapshot = self.snapshot_remote(cancel).await?;

        let dropped = self.shared.discard_pending_work();
        if dropped > 0 {
            debug!(dropped, "Discarded queued file events superseded by git sync");
        }

        let state = GitSyncState::from_heads(
            self.host.head_state(cancel).await?,
            self.remote.head_state(cancel).await?,
        )?;
        if state.is_converged() {
            debug!(
                sha = %state.host_sha,
                branch = %state.host_branch,
                "Git state already in sync"
            );
            return Ok(GitSyncOutcome::InSync);
        }

        if let Some(remote_sha) = &state.remote_sha {
            if !self.host.has_commit(remote_sha)? {
                warn!(
                    "Remote HEAD {} is not in host history; leaving remote git state alone to keep its commits",
                    short(remote_sha)
                );
                return Ok(GitSyncOutcome::RemoteAhead {
                    remote_sha: remote_sha.clone(),
                });
            }
        }

        let commits = self.transfer_commits(&state, cancel).await?;
        let applied = match self.align_remote(&state, cancel).await {
            Ok(()) => self.restore_snapshot(&snapshot, cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            snapshot.preserve(&e);
            return Err(e);
        }

        info!(
            "{}: aligned {} at {} ({} commits transferred)",
            Source::Host.direction(),
            state.host_branch,
            short(&state.host_sha),
            commits
        );
        Ok(GitSyncOutcome::Aligned { commits })
    }

    async fn snapshot_remote(&self, cancel: &CancellationToken) -> Result<Snapshot> {
        let records: Vec<ChangeRecord> =
            translate(&self.remote, &self.host, StatusScope::WholeTree, cancel).await?;
        let parent = self.host.git_dir().join("tether").join("snapshots");
        tokio::fs::create_dir_all(&parent).await?;
        let dir = tempfile::Builder::new()
            .prefix("snapshot-")
            .tempdir_in(&parent)?;
        let mut entries = Vec::with_capacity(records.len());

        for record in records {
            if let Some(old) = record.old_path {
                entries.push(Stashed::Removed(old));
            }
            if record.kind == ChangeKind::Delete {
                entries.push(Stashed::Removed(record.path));
                continue;
            }

            let target = dir.path().join(&record.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let source = self.remote.abs(&record.path);
            match self
                .remote
                .bridge()
                .copy_from_remote(self.remote.environment(), &source, &target, cancel)
                .await
            {
                Ok(()) => entries.push(Stashed::File(record.path)),
                Err(e) if e.is_not_found() => {
                    debug!(
                        path = %record.path,
                        "Remote change vanished before it could be stashed"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !entries.is_empty() {
            debug!(entries = entries.len(), "Stashed remote working-tree changes");
        }
        Ok(Snapshot { dir, entries })
    }

    /// Ship the commits the remote lacks; returns how many were sent
    async fn transfer_commits(
        &self,
        state: &GitSyncState,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if self.remote.has_commit(&state.host_sha, cancel).await? {
            return Ok(0);
        }

        let tip = if state.host_detached() {
            "HEAD".to_string()
        } else {
            format!("refs/heads/{}", state.host_branch)
        };
        let exclude = state.remote_sha.as_deref();
        let commits = self.host.count_commits(&tip, exclude, cancel).await?;
        if commits == 0 {
            return Ok(0);
        }

        let staging = TempDir::new()?;
        let bundle = staging.path().join("tether.bundle");
        self.host.create_bundle(&bundle, &tip, exclude, cancel).await?;

        let remote_bundle = format!(
            "/tmp/tether-{}-{}.bundle",
            std::process::id(),
            BUNDLE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        self.remote
            .bridge()
            .copy_to_remote(self.remote.environment(), &bundle, &remote_bundle, false, cancel)
            .await?;

        let fetched = self
            .remote
            .git(["fetch", "-q", "--no-tags", remote_bundle.as_str(), tip.as_str()], cancel)
            .await;

        let cleanup = self.remote.request(["rm", "-f", "--", remote_bundle.as_str()]);
        if let Err(e) = self.remote.run(&cleanup, cancel).await {
            debug!(bundle = %remote_bundle, "Failed to remove remote bundle: {}", e);
        }
        fetched?;

        debug!(commits, tip = %tip, "Fetched bundle into remote");
        Ok(commits)
    }

    async fn align_remote(&self, state: &GitSyncState, cancel: &CancellationToken) -> Result<()> {
        let sha = state.host_sha.as_str();
        if state.host_detached() {
            self.remote
                .git(["checkout", "-q", "-f", "--detach", sha], cancel)
                .await?;
        } else {
            self.remote
                .git(["checkout", "-q", "-f", "-B", state.host_branch.as_str(), sha], cancel)
                .await?;
        }
        self.remote.git(["reset", "-q", "--hard", sha], cancel).await?;
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for entry in &snapshot.entries {
            match entry {
                Stashed::File(path) => {
                    self.remote.ensure_parent(path, cancel).await?;
                    self.remote
                        .bridge()
                        .copy_to_remote(
                            self.remote.environment(),
                            &snapshot.dir.path().join(path),
                            &self.remote.abs(path),
                            false,
                            cancel,
                        )
                        .await?;
                }
                Stashed::Removed(path) => {
                    self.remote.remove(path, cancel).await?;
                }
            }
        }
        Ok(())
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::FaultyBridge;
    use crate::bridge::{CommandBridge, LocalBridge};
    use crate::git::host::tests::{git, init_repo};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct Harness {
        host_dir: TempDir,
        remote_dir: TempDir,
        shared: Arc<SyncShared>,
        syncer: GitSyncer,
        ticker: tokio::task::JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.ticker.abort();
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(LocalBridge::new()))
    }

    fn harness_with(bridge: Arc<dyn CommandBridge>) -> Harness {
        let host_dir = init_repo();
        let remote_dir = TempDir::new().unwrap();
        git(
            remote_dir.path(),
            &["clone", "-q", &host_dir.path().to_string_lossy(), "."],
        );
        git(remote_dir.path(), &["config", "user.name", "Remote"]);
        git(remote_dir.path(), &["config", "user.email", "remote@example.com"]);
        git(remote_dir.path(), &["config", "commit.gpgsign", "false"]);

        let shared = Arc::new(SyncShared::new(3));
        let host = HostTree::discover(host_dir.path()).unwrap();
        let remote = RemoteTree::new(
            bridge,
            "local",
            remote_dir.path().to_string_lossy().into_owned(),
            None,
        );
        let syncer = GitSyncer::new(host, remote, Arc::clone(&shared), SyncConfig::default());

        // Stands in for the batcher's idle announcements
        let ticker = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    shared.idle().signal();
                }
            })
        };

        Harness {
            host_dir,
            remote_dir,
            shared,
            syncer,
            ticker,
        }
    }

    /// Snapshot directories left under the host git dir
    fn kept_snapshots(host: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(host.join(".git/tether/snapshots")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn commit(dir: &Path, file: &str, content: &str) -> String {
        std::fs::write(dir.join(file), content).unwrap();
        git(dir, &["add", file]);
        git(dir, &["commit", "-q", "-m", &format!("update {}", file)]);
        git(dir, &["rev-parse", "HEAD"])
    }

    #[test]
    fn test_state_convergence() {
        let state = GitSyncState {
            host_sha: "abc".to_string(),
            host_branch: "main".to_string(),
            remote_sha: Some("abc".to_string()),
            remote_branch: "main".to_string(),
        };
        assert!(state.is_converged());

        let moved = GitSyncState {
            remote_branch: "other".to_string(),
            ..state.clone()
        };
        assert!(!moved.is_converged());
        assert_eq!(short("0123456789abcdef"), "0123456");
    }

    #[tokio::test]
    async fn test_in_sync_is_noop() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.shared.mark_git_pending();
        let outcome = h.syncer.sync_once(&cancel).await.unwrap();
        assert_eq!(outcome, GitSyncOutcome::InSync);
        assert!(!h.shared.git_pending());
    }

    #[tokio::test]
    async fn test_bundle_preserves_commit_hashes() {
        let h = harness();
        let cancel = CancellationToken::new();

        let c1 = commit(h.host_dir.path(), "one.txt", "1");
        let c2 = commit(h.host_dir.path(), "two.txt", "2");
        let c3 = commit(h.host_dir.path(), "three.txt", "3");

        let outcome = h.syncer.sync_once(&cancel).await.unwrap();
        assert_eq!(outcome, GitSyncOutcome::Aligned { commits: 3 });

        for sha in [&c1, &c2, &c3] {
            git(h.remote_dir.path(), &["cat-file", "-e", &format!("{}^{{commit}}", sha)]);
        }
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), c3);
        assert_eq!(git(h.remote_dir.path(), &["symbolic-ref", "--short", "HEAD"]), "main");
        assert_eq!(std::fs::read_to_string(h.remote_dir.path().join("three.txt")).unwrap(), "3");
        assert!(git(h.remote_dir.path(), &["status", "--porcelain"]).is_empty());

        // A second pass finds nothing to do
        assert_eq!(h.syncer.sync_once(&cancel).await.unwrap(), GitSyncOutcome::InSync);
    }

    #[tokio::test]
    async fn test_remote_ahead_is_left_alone() {
        let h = harness();
        let cancel = CancellationToken::new();

        let remote_only = commit(h.remote_dir.path(), "remote.txt", "mine");
        h.shared.mark_git_pending();
        let outcome = h.syncer.sync_once(&cancel).await.unwrap();
        assert_eq!(
            outcome,
            GitSyncOutcome::RemoteAhead {
                remote_sha: remote_only.clone()
            }
        );
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), remote_only);
        assert!(!h.shared.git_pending(), "file sync must resume after an abort");
    }

    #[tokio::test]
    async fn test_remote_uncommitted_changes_survive() {
        let h = harness();
        let cancel = CancellationToken::new();

        std::fs::write(h.remote_dir.path().join("README.md"), "edited remotely\n").unwrap();
        std::fs::write(h.remote_dir.path().join("scratch.txt"), "wip\n").unwrap();
        let head = commit(h.host_dir.path(), "feature.rs", "fn main() {}\n");

        let outcome = h.syncer.sync_once(&cancel).await.unwrap();
        assert_eq!(outcome, GitSyncOutcome::Aligned { commits: 1 });
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), head);
        assert_eq!(
            std::fs::read_to_string(h.remote_dir.path().join("README.md")).unwrap(),
            "edited remotely\n"
        );
        assert_eq!(
            std::fs::read_to_string(h.remote_dir.path().join("scratch.txt")).unwrap(),
            "wip\n"
        );
        assert!(kept_snapshots(h.host_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_remote_changes_on_host() {
        // Bundles get through, putting the stashed files back does not
        let bridge = FaultyBridge::new().failing_copy_to_remote(|path| {
            (!path.ends_with(".bundle"))
                .then(|| Error::command("docker cp", Some(1), "no space left on device"))
        });
        let h = harness_with(Arc::new(bridge));
        let cancel = CancellationToken::new();

        std::fs::write(h.remote_dir.path().join("README.md"), "edited remotely\n").unwrap();
        let head = commit(h.host_dir.path(), "feature.rs", "fn main() {}\n");
        h.shared.mark_git_pending();

        let err = h.syncer.sync_once(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("no space left on device"), "{}", err);
        assert!(!h.shared.git_pending());
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), head);

        let kept = kept_snapshots(h.host_dir.path());
        assert_eq!(kept.len(), 1, "{:?}", kept);
        assert_eq!(
            std::fs::read_to_string(kept[0].join("README.md")).unwrap(),
            "edited remotely\n"
        );
    }

    #[tokio::test]
    async fn test_branch_switch_and_detached_head() {
        let h = harness();
        let cancel = CancellationToken::new();

        git(h.host_dir.path(), &["checkout", "-q", "-b", "feature"]);
        let tip = commit(h.host_dir.path(), "f.txt", "f");
        assert_eq!(
            h.syncer.sync_once(&cancel).await.unwrap(),
            GitSyncOutcome::Aligned { commits: 1 }
        );
        assert_eq!(git(h.remote_dir.path(), &["symbolic-ref", "--short", "HEAD"]), "feature");
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), tip);

        // Pointer-only move: the remote already has the commit
        git(h.host_dir.path(), &["checkout", "-q", "--detach", "main"]);
        let main = git(h.host_dir.path(), &["rev-parse", "HEAD"]);
        assert_eq!(
            h.syncer.sync_once(&cancel).await.unwrap(),
            GitSyncOutcome::Aligned { commits: 0 }
        );
        assert_eq!(git(h.remote_dir.path(), &["rev-parse", "HEAD"]), main);
        assert!(!h.remote_dir.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn test_host_without_commits_is_fatal() {
        let host_dir = TempDir::new().unwrap();
        git(host_dir.path(), &["init", "-q", "-b", "main"]);
        let remote_dir = TempDir::new().unwrap();
        git(remote_dir.path(), &["init", "-q", "-b", "main"]);

        let shared = Arc::new(SyncShared::new(3));
        let syncer = GitSyncer::new(
            HostTree::discover(host_dir.path()).unwrap(),
            RemoteTree::new(
                Arc::new(LocalBridge::new()),
                "local",
                remote_dir.path().to_string_lossy().into_owned(),
                None,
            ),
            Arc::clone(&shared),
            SyncConfig::default(),
        );

        let idle = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shared.idle().signal();
            })
        };
        let err = syncer.sync_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Sync(_)));
        idle.await.unwrap();
    }
}

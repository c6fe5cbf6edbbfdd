//! Sync engine: wires the five loops together for one session

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::batcher::EventBatcher;
use super::git_syncer::GitSyncer;
use super::git_watcher::GitStateWatcher;
use super::host_watcher::HostWatcher;
use super::remote_watcher::RemoteWatcher;
use super::state::SyncShared;
use crate::bridge::CommandBridge;
use crate::config::SyncConfig;
use crate::git::{HostTree, RemoteTree};
use crate::session::SyncSession;
use crate::{Error, Result};

/// Runs a sync session until cancelled or until a loop fails
pub struct SyncEngine {
    session: SyncSession,
    config: SyncConfig,
    bridge: Arc<dyn CommandBridge>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("session", &self.session)
            .field("bridge", &self.bridge.name())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(session: SyncSession, config: SyncConfig, bridge: Arc<dyn CommandBridge>) -> Self {
        Self {
            session,
            config,
            bridge,
        }
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// Check preconditions, then run every loop until `cancel` fires
    ///
    /// The first loop to fail cancels the others and its error is returned.
    /// A loop that stops on its own before cancellation also ends the session.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let host = HostTree::discover(&self.session.local_path)?;
        let remote = RemoteTree::new(
            Arc::clone(&self.bridge),
            self.session.environment.clone(),
            self.session.remote_dir.clone(),
            self.session.user.clone(),
        );

        let remote_watcher = RemoteWatcher::new(
            Arc::clone(&self.bridge),
            self.session.environment.clone(),
            self.session.remote_dir.clone(),
            self.session.user.clone(),
        )
        .with_binary(self.session.watch_binary.clone())
        .with_grace(self.config.watch_grace)
        .with_debug(self.session.debug);

        remote_watcher.preflight(&cancel).await?;
        self.check_remote_repo(&remote, &cancel).await?;

        let shared = Arc::new(SyncShared::new(self.config.max_attempts));
        let (event_tx, event_rx) = mpsc::channel(self.config.queue_capacity);
        let (git_tx, git_rx) = mpsc::channel(1);

        let loops = cancel.child_token();
        let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        // Reconcile git state once before trusting file events
        shared.mark_git_pending();
        let _ = git_tx.try_send(());

        {
            let watcher = HostWatcher::new(host.root().to_path_buf());
            let (tx, token) = (event_tx.clone(), loops.clone());
            tasks.spawn(async move { ("host watcher", watcher.run(tx, token).await) });
        }
        {
            let (tx, token) = (event_tx, loops.clone());
            tasks.spawn(async move { ("remote watcher", remote_watcher.run(tx, token).await) });
        }
        {
            let batcher = EventBatcher::new(
                host.clone(),
                remote.clone(),
                Arc::clone(&shared),
                self.config.clone(),
            );
            let token = loops.clone();
            tasks.spawn(async move { ("event batcher", batcher.run(event_rx, token).await) });
        }
        {
            let watcher =
                GitStateWatcher::new(host.git_dir(), host.common_dir(), Arc::clone(&shared));
            let token = loops.clone();
            tasks.spawn(async move { ("git state watcher", watcher.run(git_tx, token).await) });
        }
        {
            let syncer = GitSyncer::new(
                host.clone(),
                remote.clone(),
                Arc::clone(&shared),
                self.config.clone(),
            );
            let token = loops.clone();
            tasks.spawn(async move { ("git syncer", syncer.run(git_rx, token).await) });
        }

        info!(
            "Syncing {} with {}:{}",
            host.root().display(),
            self.session.environment,
            self.session.remote_dir
        );

        let mut failure: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let stopped_early = !loops.is_cancelled();
            match joined {
                Ok((name, Ok(()))) => {
                    debug!("{} stopped", name);
                    if stopped_early && failure.is_none() {
                        failure = Some(Error::Sync(format!("{} stopped unexpectedly", name)));
                    }
                }
                Ok((name, Err(e))) => {
                    if stopped_early && failure.is_none() {
                        error!("{} failed: {}", name, e);
                        failure = Some(e);
                    } else {
                        debug!("{} ended during shutdown: {}", name, e);
                    }
                }
                Err(e) => {
                    error!("Sync task panicked: {}", e);
                    failure
                        .get_or_insert_with(|| Error::Sync(format!("Sync task panicked: {}", e)));
                }
            }
            loops.cancel();
        }

        match failure {
            Some(e) if !cancel.is_cancelled() => Err(e),
            _ => {
                info!("Sync stopped");
                Ok(())
            }
        }
    }

    async fn check_remote_repo(
        &self,
        remote: &RemoteTree,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match remote.git(["rev-parse", "--is-inside-work-tree"], cancel).await {
            Ok(out) if out.trim() == "true" => Ok(()),
            Ok(_) | Err(Error::Command { .. }) => Err(Error::Config(format!(
                "{} in environment '{}' is not a git working tree",
                self.session.remote_dir, self.session.environment
            ))),
            Err(e) => Err(e),
        }
    }
}

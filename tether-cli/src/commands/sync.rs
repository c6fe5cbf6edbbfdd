//! Sync command - Run the sync engine against a container

use std::path::PathBuf;

use clap::Args;
use tether_core::bridge;
use tether_core::{
    BridgeKind, Config, HostTree, SessionRecord, SessionRegistry, SyncEngine, SyncSession,
};
use tokio_util::sync::CancellationToken;

/// Arguments for the sync command
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Container name or id to sync with
    #[arg(required = true)]
    pub environment: String,

    /// Local path inside the working tree (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,

    /// Working directory inside the container
    #[arg(short = 'r', long, required = true)]
    pub remote_dir: String,

    /// Application user inside the container (overrides config and env)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Command bridge: docker or local
    #[arg(long)]
    pub bridge: Option<BridgeKind>,

    /// Debug logging from the sync engine
    #[arg(long)]
    pub debug: bool,

    /// Take over the path even if another session is syncing it
    #[arg(long)]
    pub force: bool,
}

impl SyncArgs {
    /// Execute the sync command
    pub async fn execute(&self, verbose: bool, config: &Config) -> anyhow::Result<()> {
        let config = config
            .clone()
            .with_cli_overrides(None, self.user.clone(), self.bridge);
        config.validate()?;

        // Resolve to absolute path
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            std::env::current_dir()?.join(&self.path)
        };
        let host = HostTree::discover(&path)?;

        let registry = SessionRegistry::new()?;
        let record = SessionRecord::new(&self.environment, &self.remote_dir, host.root());
        let _guard = registry.register(record, self.force)?;

        if verbose {
            tracing::info!(
                environment = %self.environment,
                remote_dir = %self.remote_dir,
                root = %host.root().display(),
                bridge = %config.remote.bridge,
                "Starting tether sync"
            );
        }

        println!("Tether Sync");
        println!("===========");
        println!();
        println!("Local:  {}", host.root().display());
        println!("Remote: {}:{}", self.environment, self.remote_dir);
        println!();
        println!("Press Ctrl-C to stop");
        println!();

        let session = SyncSession::new(&self.environment, &self.remote_dir, host.root())
            .with_remote_config(&config.remote)
            .with_debug(self.debug);
        let engine =
            SyncEngine::new(session, config.sync.clone(), bridge::from_config(&config.remote));

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, stopping sync");
                    cancel.cancel();
                }
            });
        }

        engine.run(cancel).await?;
        println!("Sync stopped");
        Ok(())
    }
}

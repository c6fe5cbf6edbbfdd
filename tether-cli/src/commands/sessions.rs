//! Session registry commands

use clap::{Args, Subcommand};
use tether_core::SessionRegistry;

/// Session registry commands
#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    pub command: Option<SessionsCommand>,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List registered sync sessions
    List,

    /// Remove records left behind by sessions that are no longer running
    Prune,
}

impl SessionsArgs {
    /// Execute the sessions command
    pub fn execute(&self, verbose: bool) -> anyhow::Result<()> {
        let registry = SessionRegistry::new()?;
        match self.command.as_ref().unwrap_or(&SessionsCommand::List) {
            SessionsCommand::List => list_sessions(&registry, verbose),
            SessionsCommand::Prune => prune_sessions(&registry),
        }
    }
}

fn list_sessions(registry: &SessionRegistry, verbose: bool) -> anyhow::Result<()> {
    let sessions = registry.list()?;
    if sessions.is_empty() {
        println!("No sync sessions registered.");
        return Ok(());
    }

    println!("Sync sessions:");
    println!();
    for session in &sessions {
        let record = &session.record;
        let status = if session.alive { "running" } else { "stale" };
        println!("  {} [{}]", record.local_path.display(), status);
        println!("    Remote:  {}:{}", record.environment, record.remote_dir);
        println!("    PID:     {}", record.pid);
        println!("    Started: {}", record.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if verbose {
            println!("    Record:  {}", session.path.display());
        }
    }

    let stale = sessions.iter().filter(|s| !s.alive).count();
    if stale > 0 {
        println!();
        println!("{} stale record(s); run 'tether sessions prune' to remove them", stale);
    }
    Ok(())
}

fn prune_sessions(registry: &SessionRegistry) -> anyhow::Result<()> {
    let removed = registry.prune()?;
    if removed.is_empty() {
        println!("No stale sessions.");
    } else {
        for record in &removed {
            println!("Removed {} (pid {})", record.local_path.display(), record.pid);
        }
    }
    Ok(())
}

//! Tether CLI - Command line interface for tether
//!
//! Keeps a local git working tree and a container's copy of it in sync.

mod commands;

use clap::{Parser, Subcommand};
use tether_core::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{SessionsArgs, SyncArgs};

/// Tether: bidirectional working-tree sync with a container
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to docker executable (overrides config and env)
    #[arg(long, global = true, env = "TETHER_DOCKER_PATH")]
    docker_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Sync the current working tree with a container until interrupted
    #[command(visible_alias = "s")]
    Sync(SyncArgs),

    /// Inspect or clean up the session registry
    Sessions(SessionsArgs),

    /// Show current configuration
    Config,
}

impl Cli {
    /// Directives used when `RUST_LOG` is unset; debug output stays scoped to tether
    fn default_directives(&self) -> &'static str {
        let debug = matches!(&self.command, Some(Commands::Sync(args)) if args.debug);
        if debug || self.verbose {
            "info,tether_core=debug,tether=debug"
        } else {
            "info"
        }
    }

    fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(cli.log_filter())
        .init();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    // Load configuration with overrides
    let config = Config::load_with_overrides(cli.docker_path.clone(), None, None)?;

    if cli.verbose {
        tracing::info!(
            bridge = %config.remote.bridge,
            docker_path = %config.remote.docker_path,
            "Configuration loaded"
        );
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Sync(args)) => {
            args.execute(cli.verbose, &config).await?;
        }
        Some(Commands::Sessions(args)) => {
            args.execute(cli.verbose)?;
        }
        Some(Commands::Config) => {
            print_config(&config);
        }
        None => {
            println!("Tether - Bidirectional working-tree sync with a container");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn print_config(config: &Config) {
    println!("Tether Configuration");
    println!("====================");
    println!();
    println!("Remote Settings:");
    println!("  bridge: {}", config.remote.bridge);
    println!("  docker_path: {}", config.remote.docker_path);
    println!("  user: {}", config.remote.user.as_deref().unwrap_or("(container default)"));
    println!("  watch_binary: {}", config.remote.watch_binary);
    println!();
    println!("Sync Settings:");
    println!("  debounce: {:?}", config.sync.debounce);
    println!("  max_wait: {:?}", config.sync.max_wait);
    println!("  git_debounce: {:?}", config.sync.git_debounce);
    println!("  flush_timeout: {:?}", config.sync.flush_timeout);
    println!("  idle_interval: {:?}", config.sync.idle_interval);
    println!("  watch_grace: {:?}", config.sync.watch_grace);
    println!("  max_attempts: {}", config.sync.max_attempts);
    println!("  queue_capacity: {}", config.sync.queue_capacity);
    println!();
    if let Some(path) = Config::default_config_path() {
        println!("Config file: {}", path.display());
        if path.exists() {
            println!("  (exists)");
        } else {
            println!("  (not found - using defaults)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_logging_is_scoped_to_tether() {
        let cli = Cli::parse_from(["tether", "sync", "web", "-r", "/app", "--debug"]);
        let directives = cli.default_directives();
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("tether_core=debug"));

        let cli = Cli::parse_from(["tether", "config"]);
        assert_eq!(cli.default_directives(), "info");
    }
}

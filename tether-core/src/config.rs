//! Configuration management for tether
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (TETHER_*)
//! 3. Config file (~/.config/tether/config.toml)
//! 4. Default values

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which command bridge carries exec/copy calls to the remote environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// `docker exec` / `docker cp` against a container
    #[default]
    Docker,
    /// Treat a local directory as the remote working tree
    Local,
}

impl std::str::FromStr for BridgeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(Error::Config(format!(
                "Unknown bridge '{}'. Expected 'docker' or 'local'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Timing and retry settings for the sync engine
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last file event before a flush
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Longest a queued path waits for a flush while events keep arriving
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    /// Quiet period after the last git metadata change before a git sync
    #[serde(with = "humantime_serde")]
    pub git_debounce: Duration,

    /// Wall-clock budget for one flush
    #[serde(with = "humantime_serde")]
    pub flush_timeout: Duration,

    /// How often the batcher announces idleness
    #[serde(with = "humantime_serde")]
    pub idle_interval: Duration,

    /// Grace period for stopping the remote watch process
    #[serde(with = "humantime_serde")]
    pub watch_grace: Duration,

    /// Attempts per path before a transient failure is dropped
    pub max_attempts: u32,

    /// Capacity of the shared event queue
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_wait: Duration::from_secs(2),
            git_debounce: Duration::from_millis(750),
            flush_timeout: Duration::from_secs(30),
            idle_interval: Duration::from_secs(1),
            watch_grace: Duration::from_secs(2),
            max_attempts: 3,
            queue_capacity: 1024,
        }
    }
}

/// Remote environment settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bridge implementation
    pub bridge: BridgeKind,

    /// Path to the docker executable
    pub docker_path: String,

    /// Unprivileged application user inside the remote environment
    pub user: Option<String>,

    /// Recursive watch binary available inside the remote environment
    pub watch_binary: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeKind::Docker,
            docker_path: "docker".to_string(),
            user: None,
            watch_binary: "inotifywait".to_string(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Sync engine timing
    pub sync: SyncConfig,

    /// Remote environment access
    pub remote: RemoteConfig,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();

        if let Some(path) = config_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/tether/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tether").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - TETHER_DOCKER_PATH: Path to docker executable
    /// - TETHER_REMOTE_USER: Application user inside the remote environment
    /// - TETHER_WATCH_BINARY: Watch binary inside the remote environment
    /// - TETHER_BRIDGE: `docker` or `local`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(docker_path) = std::env::var("TETHER_DOCKER_PATH") {
            self.remote.docker_path = docker_path;
        }

        if let Ok(user) = std::env::var("TETHER_REMOTE_USER") {
            self.remote.user = Some(user);
        }

        if let Ok(binary) = std::env::var("TETHER_WATCH_BINARY") {
            self.remote.watch_binary = binary;
        }

        if let Ok(bridge) = std::env::var("TETHER_BRIDGE") {
            self.remote.bridge = bridge.parse()?;
        }

        Ok(self)
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(
        mut self,
        docker_path: Option<String>,
        user: Option<String>,
        bridge: Option<BridgeKind>,
    ) -> Self {
        if let Some(path) = docker_path {
            self.remote.docker_path = path;
        }

        if let Some(u) = user {
            self.remote.user = Some(u);
        }

        if let Some(b) = bridge {
            self.remote.bridge = b;
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(
        docker_path: Option<String>,
        user: Option<String>,
        bridge: Option<BridgeKind>,
    ) -> Result<Self> {
        Ok(Self::load()?
            .with_env_overrides()?
            .with_cli_overrides(docker_path, user, bridge))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be at least 1".to_string()));
        }
        if self.sync.queue_capacity == 0 {
            return Err(Error::Config("sync.queue_capacity must be at least 1".to_string()));
        }
        if self.sync.flush_timeout.is_zero() {
            return Err(Error::Config("sync.flush_timeout must be non-zero".to_string()));
        }
        if self.sync.max_wait < self.sync.debounce {
            return Err(Error::Config(
                "sync.max_wait must not be shorter than sync.debounce".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.remote.docker_path, "docker");
        assert_eq!(config.remote.bridge, BridgeKind::Docker);
        assert_eq!(config.remote.watch_binary, "inotifywait");
        assert!(config.remote.user.is_none());
        assert_eq!(config.sync.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default().with_cli_overrides(
            Some("/usr/local/bin/docker".to_string()),
            Some("app".to_string()),
            Some(BridgeKind::Local),
        );

        assert_eq!(config.remote.docker_path, "/usr/local/bin/docker");
        assert_eq!(config.remote.user.as_deref(), Some("app"));
        assert_eq!(config.remote.bridge, BridgeKind::Local);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[sync]
debounce = "150ms"
flush_timeout = "1m"
max_attempts = 5

[remote]
bridge = "local"
user = "www-data"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.debounce, Duration::from_millis(150));
        assert_eq!(config.sync.flush_timeout, Duration::from_secs(60));
        assert_eq!(config.sync.max_attempts, 5);
        // untouched fields keep their defaults
        assert_eq!(config.sync.git_debounce, Duration::from_millis(750));
        assert_eq!(config.remote.bridge, BridgeKind::Local);
        assert_eq!(config.remote.user.as_deref(), Some("www-data"));
        assert_eq!(config.remote.docker_path, "docker");
    }

    #[test]
    fn test_validate_rejects_max_wait_below_debounce() {
        let mut config = Config::default();
        config.sync.debounce = Duration::from_millis(500);
        config.sync.max_wait = Duration::from_millis(200);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.sync.max_wait = Duration::from_millis(500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.sync.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bridge_kind_parse() {
        assert_eq!("Docker".parse::<BridgeKind>().unwrap(), BridgeKind::Docker);
        assert_eq!("local".parse::<BridgeKind>().unwrap(), BridgeKind::Local);
        assert!("ssh".parse::<BridgeKind>().is_err());
    }
}

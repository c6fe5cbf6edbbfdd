//! Parameters of one sync session

use std::path::PathBuf;

use crate::config::RemoteConfig;

/// What to keep in sync, fixed for the life of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Remote environment identifier (container name or id)
    pub environment: String,
    /// Working directory inside the remote environment
    pub remote_dir: String,
    /// Host path inside the working tree to sync
    pub local_path: PathBuf,
    /// Unprivileged application user inside the remote environment
    pub user: Option<String>,
    /// Watch binary inside the remote environment
    pub watch_binary: String,
    /// Log discarded watch lines and other diagnostics
    pub debug: bool,
}

impl SyncSession {
    /// Create a session with default remote settings
    pub fn new(
        environment: impl Into<String>,
        remote_dir: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let defaults = RemoteConfig::default();
        Self {
            environment: environment.into(),
            remote_dir: remote_dir.into(),
            local_path: local_path.into(),
            user: defaults.user,
            watch_binary: defaults.watch_binary,
            debug: false,
        }
    }

    /// Take the user and watch binary from configuration
    pub fn with_remote_config(mut self, remote: &RemoteConfig) -> Self {
        self.user = remote.user.clone();
        self.watch_binary = remote.watch_binary.clone();
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_watch_binary(mut self, binary: impl Into<String>) -> Self {
        self.watch_binary = binary.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

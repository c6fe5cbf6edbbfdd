//! Error types for tether

use thiserror::Error;

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for tether operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// libgit2 error on the host repository
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host git or remote exec command exited unsuccessfully
    #[error("{program} failed (exit {}): {}", exit_label(.code), .stderr.trim())]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Watcher setup failed or the remote watch process died
    #[error("Watch error: {0}")]
    Watch(String),

    /// Another live session owns the local path
    #[error("Session registry: {0}")]
    Registry(String),

    /// Engine-level failure that ends the sync session
    #[error("Sync error: {0}")]
    Sync(String),

    /// The operation was cancelled by the session's shutdown signal
    #[error("operation cancelled")]
    Cancelled,

    /// An operation exceeded its time budget
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Fragments of remote stderr that mark a failure as worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "permission denied",
    "text file busy",
    "operation not permitted",
];

/// Fragments that mean the source path no longer exists
const NOT_FOUND_MARKERS: &[&str] = &["no such file or directory", "could not find the file"];

#[cfg(unix)]
const ETXTBSY: i32 = 26;

impl Error {
    /// Helper for command failures
    pub fn command(
        program: impl Into<String>,
        code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::Command {
            program: program.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Whether the failure is expected to clear up on its own (busy or
    /// permission-denied files) and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return true;
                }
                #[cfg(unix)]
                if e.raw_os_error() == Some(ETXTBSY) {
                    return true;
                }
                false
            }
            Self::Command { stderr, .. } => contains_any(stderr, TRANSIENT_MARKERS),
            _ => false,
        }
    }

    /// Whether the failure means the source path vanished
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Command { stderr, .. } => contains_any(stderr, NOT_FOUND_MARKERS),
            _ => false,
        }
    }

    /// Whether the failure came from the shutdown signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

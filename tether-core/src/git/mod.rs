//! Git access to both working trees
//!
//! [`WorkTree`] is the side-agnostic view the sync engine works against:
//! [`HostTree`] answers from the local repository, [`RemoteTree`] runs the
//! remote git CLI through the command bridge.

pub(crate) mod host;
mod porcelain;
mod remote;

pub use host::HostTree;
pub use porcelain::{parse_porcelain_z, StatusEntry};
pub use remote::RemoteTree;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::sync::Source;
use crate::Result;

/// Branch name reported for a detached HEAD
pub const DETACHED: &str = "HEAD";

/// Largest number of paths passed to a single git invocation
pub(crate) const PATH_CHUNK: usize = 256;

/// What a status query covers
#[derive(Debug, Clone, Copy)]
pub enum StatusScope<'a> {
    /// Only these root-relative paths
    Paths(&'a [String]),
    /// The whole working tree
    WholeTree,
}

/// Where HEAD points on one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadState {
    /// Commit SHA, `None` for an unborn branch
    pub sha: Option<String>,
    /// Short branch name, or [`DETACHED`]
    pub branch: String,
}

impl HeadState {
    /// Whether HEAD is detached
    pub fn is_detached(&self) -> bool {
        self.branch == DETACHED
    }
}

/// One side's git working tree, addressed by root-relative paths
#[async_trait]
pub trait WorkTree: Send + Sync {
    /// Which side this tree lives on
    fn side(&self) -> Source;

    /// Porcelain status entries for the scope
    async fn status(
        &self,
        scope: StatusScope<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StatusEntry>>;

    /// Subset of `paths` matched by gitignore
    async fn ignored(&self, paths: &[String], cancel: &CancellationToken)
        -> Result<HashSet<String>>;

    /// Subset of `paths` tracked in the index
    async fn tracked(&self, paths: &[String], cancel: &CancellationToken)
        -> Result<HashSet<String>>;

    /// Subset of `paths` present on disk
    async fn existing(
        &self,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>>;

    /// Git blob hash of a regular file, `None` if it does not exist
    async fn blob_hash(&self, path: &str, cancel: &CancellationToken) -> Result<Option<String>>;

    /// Remove a file or directory; returns whether anything was there
    async fn remove(&self, path: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Current HEAD commit and branch
    async fn head_state(&self, cancel: &CancellationToken) -> Result<HeadState>;
}

/// Split NUL-terminated git output into owned strings
pub(crate) fn split_nul(output: &str) -> impl Iterator<Item = String> + '_ {
    output.split('\0').filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_nul() {
        let items: Vec<String> = split_nul("a.txt\0dir/b.txt\0\0").collect();
        assert_eq!(items, vec!["a.txt", "dir/b.txt"]);
        assert_eq!(split_nul("").count(), 0);
    }

    #[test]
    fn test_head_state_detached() {
        let head = HeadState {
            sha: Some("abc".to_string()),
            branch: DETACHED.to_string(),
        };
        assert!(head.is_detached());
    }
}

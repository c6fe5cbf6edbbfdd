//! Host-side working tree

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{ErrorCode, ObjectType, Oid, Repository};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{
    parse_porcelain_z, split_nul, HeadState, StatusEntry, StatusScope, WorkTree, DETACHED,
    PATH_CHUNK,
};
use crate::bridge::run_command;
use crate::sync::Source;
use crate::{Error, Result};

/// The local git working tree
///
/// Holds paths rather than a `git2::Repository` so it can be shared across
/// tasks; the repository is reopened for each libgit2 query.
#[derive(Debug, Clone)]
pub struct HostTree {
    /// Working tree root (canonical)
    root: PathBuf,
    /// Per-worktree git directory (HEAD, logs/HEAD)
    git_dir: PathBuf,
    /// Shared git directory (refs/heads, packed-refs)
    common_dir: PathBuf,
}

impl HostTree {
    /// Open the repository containing `path`
    ///
    /// This will search upward from the given path to find the repository root.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let repo = Repository::discover(path).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                Error::Config(format!(
                    "Not a git repository: {}. Run 'git init' first or navigate to a git repository.",
                    path.display()
                ))
            } else {
                Error::Git(e)
            }
        })?;

        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Config("Bare repositories are not supported".to_string()))?;

        Ok(Self {
            root: std::fs::canonicalize(workdir)?,
            git_dir: std::fs::canonicalize(repo.path())?,
            common_dir: std::fs::canonicalize(repo.commondir())?,
        })
    }

    /// Check if the given path is inside a git repository
    pub fn is_git_repo(path: impl AsRef<Path>) -> bool {
        Repository::discover(path.as_ref()).is_ok()
    }

    /// Working tree root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Git directory holding HEAD and its reflog
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Git directory holding shared refs
    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    /// Absolute host path for a root-relative path
    pub fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Permission bits of a host file, `None` if it is gone
    pub fn file_mode(&self, rel: &str) -> Result<Option<u32>> {
        match std::fs::metadata(self.abs(rel)) {
            Ok(meta) => Ok(Some(permission_bits(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Whether the commit exists in the host object database
    pub fn has_commit(&self, sha: &str) -> Result<bool> {
        let repo = self.open()?;
        let oid = match Oid::from_str(sha) {
            Ok(oid) => oid,
            Err(_) => return Ok(false),
        };
        let found = match repo.find_commit(oid) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(Error::Git(e)),
        };
        found
    }

    /// Number of commits reachable from `tip` but not from `exclude`
    pub async fn count_commits(
        &self,
        tip: &str,
        exclude: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut args = vec!["rev-list".to_string(), "--count".to_string(), tip.to_string()];
        if let Some(base) = exclude {
            args.push(format!("^{}", base));
        }
        let out = self.run_git(&args, cancel).await?;
        out.trim()
            .parse()
            .map_err(|_| Error::Sync(format!("Unexpected rev-list output: {}", out.trim())))
    }

    /// Write a bundle of the commits reachable from `tip` but not `exclude`
    pub async fn create_bundle(
        &self,
        file: &Path,
        tip: &str,
        exclude: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut args = vec![
            "bundle".to_string(),
            "create".to_string(),
            file.to_string_lossy().into_owned(),
            tip.to_string(),
        ];
        if let Some(base) = exclude {
            args.push(format!("^{}", base));
        }
        self.run_git(&args, cancel).await?;
        Ok(())
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.root).map_err(Error::Git)
    }

    async fn run_git(&self, args: &[String], cancel: &CancellationToken) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .env("GIT_OPTIONAL_LOCKS", "0");
        run_command(cmd, "git", cancel).await
    }

    async fn run_git_paths(
        &self,
        base: &[&str],
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        args.push("--".to_string());
        args.extend(paths.iter().cloned());
        self.run_git(&args, cancel).await
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[async_trait]
impl WorkTree for HostTree {
    fn side(&self) -> Source {
        Source::Host
    }

    async fn status(
        &self,
        scope: StatusScope<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StatusEntry>> {
        const BASE: &[&str] = &[
            "--literal-pathspecs",
            "status",
            "--porcelain=v1",
            "-z",
            "--untracked-files=all",
        ];
        match scope {
            StatusScope::WholeTree => {
                let args: Vec<String> = BASE.iter().map(|s| s.to_string()).collect();
                Ok(parse_porcelain_z(&self.run_git(&args, cancel).await?))
            }
            StatusScope::Paths(paths) => {
                let mut entries = Vec::new();
                for chunk in paths.chunks(PATH_CHUNK) {
                    let out = self.run_git_paths(BASE, chunk, cancel).await?;
                    entries.extend(parse_porcelain_z(&out));
                }
                Ok(entries)
            }
        }
    }

    async fn ignored(
        &self,
        paths: &[String],
        _cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let repo = self.open()?;
        let index = repo.index()?;
        let mut ignored = HashSet::new();
        for path in paths {
            // tracked paths are never ignored, even under an ignored directory
            if index.get_path(Path::new(path), 0).is_some() {
                continue;
            }
            if repo.is_path_ignored(path)? {
                ignored.insert(path.clone());
            }
        }
        Ok(ignored)
    }

    async fn tracked(
        &self,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let mut tracked = HashSet::new();
        for chunk in paths.chunks(PATH_CHUNK) {
            let out = self
                .run_git_paths(&["--literal-pathspecs", "ls-files", "-z"], chunk, cancel)
                .await?;
            tracked.extend(split_nul(&out));
        }
        Ok(tracked)
    }

    async fn existing(
        &self,
        paths: &[String],
        _cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        Ok(paths
            .iter()
            .filter(|p| std::fs::symlink_metadata(self.abs(p)).is_ok())
            .cloned()
            .collect())
    }

    async fn blob_hash(&self, path: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        let abs = self.abs(path);
        match std::fs::metadata(&abs) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }

        let target = abs.clone();
        let hashed = tokio::task::spawn_blocking(move || Oid::hash_file(ObjectType::Blob, &target))
            .await
            .map_err(|e| Error::Sync(format!("Hash task failed: {}", e)))?;

        match hashed {
            Ok(oid) => Ok(Some(oid.to_string())),
            // Removed between the metadata check and the read
            Err(_) if !abs.exists() => Ok(None),
            Err(e) => Err(Error::Git(e)),
        }
    }

    async fn remove(&self, path: &str, _cancel: &CancellationToken) -> Result<bool> {
        let abs = self.abs(path);
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        };

        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&abs).await
        } else {
            tokio::fs::remove_file(&abs).await
        };

        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn head_state(&self, _cancel: &CancellationToken) -> Result<HeadState> {
        let repo = self.open()?;

        let branch = {
            let head_ref = repo.find_reference("HEAD")?;
            match head_ref.symbolic_target() {
                Some(target) => target
                    .strip_prefix("refs/heads/")
                    .unwrap_or(target)
                    .to_string(),
                None => DETACHED.to_string(),
            }
        };

        let sha = match repo.head() {
            Ok(head) => head.target().map(|oid| oid.to_string()),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(Error::Git(e)),
        };

        Ok(HeadState { sha, branch })
    }
}

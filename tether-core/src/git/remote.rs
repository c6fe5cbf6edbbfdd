//! Remote-side working tree, driven through the command bridge

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    parse_porcelain_z, split_nul, HeadState, StatusEntry, StatusScope, WorkTree, DETACHED,
    PATH_CHUNK,
};
use crate::bridge::{CommandBridge, ExecRequest};
use crate::sync::paths::remote_join;
use crate::sync::Source;
use crate::{Error, Result};

/// Prints each argument that exists, NUL-terminated
const EXISTING_SCRIPT: &str =
    r#"for p do if [ -e "$p" ] || [ -L "$p" ]; then printf '%s\000' "$p"; fi; done"#;

/// Hashes `$1` if it is a regular file, prints nothing otherwise
const HASH_SCRIPT: &str = r#"if [ -f "$1" ]; then git hash-object --no-filters -- "$1"; fi"#;

/// Feeds the arguments to `check-ignore` NUL-separated, printing the ignored ones
const IGNORED_SCRIPT: &str = r#"printf '%s\000' "$@" | git check-ignore --stdin -z"#;

/// Removes `$1` recursively, printing a marker when something was there
const REMOVE_SCRIPT: &str =
    r#"if [ -e "$1" ] || [ -L "$1" ]; then rm -rf -- "$1" && echo removed; fi"#;

/// The git working tree inside the remote environment
#[derive(Clone)]
pub struct RemoteTree {
    bridge: Arc<dyn CommandBridge>,
    environment: String,
    root: String,
    user: Option<String>,
}

impl std::fmt::Debug for RemoteTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTree")
            .field("bridge", &self.bridge.name())
            .field("environment", &self.environment)
            .field("root", &self.root)
            .field("user", &self.user)
            .finish()
    }
}

impl RemoteTree {
    /// Create a view of `root` inside `environment`
    pub fn new(
        bridge: Arc<dyn CommandBridge>,
        environment: impl Into<String>,
        root: impl Into<String>,
        user: Option<String>,
    ) -> Self {
        Self {
            bridge,
            environment: environment.into(),
            root: root.into(),
            user,
        }
    }

    /// Remote working directory
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Environment identifier
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The bridge carrying this tree's commands
    pub fn bridge(&self) -> &Arc<dyn CommandBridge> {
        &self.bridge
    }

    /// Absolute remote path for a root-relative path
    pub fn abs(&self, rel: &str) -> String {
        remote_join(&self.root, rel)
    }

    /// Request skeleton rooted at the working directory, as the app user
    pub fn request<I, S>(&self, argv: I) -> ExecRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecRequest::new(argv)
            .workdir(self.root.clone())
            .user(self.user.clone())
    }

    /// Run a command in the working directory
    pub async fn run(&self, request: &ExecRequest, cancel: &CancellationToken) -> Result<String> {
        self.bridge.exec(&self.environment, request, cancel).await
    }

    /// Run git with `args` in the working directory
    pub async fn git<I, S>(&self, args: I, cancel: &CancellationToken) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let req = self
            .request(["git"])
            .args(args)
            .env("GIT_OPTIONAL_LOCKS", "0");
        self.run(&req, cancel).await
    }

    /// Run an inline `sh` script with positional arguments
    async fn script(
        &self,
        script: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let req = self
            .request(["sh", "-c", script, "sh"])
            .args(args.iter().cloned());
        self.run(&req, cancel).await
    }

    async fn git_paths(
        &self,
        base: &[&str],
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let args = base
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once("--".to_string()))
            .chain(paths.iter().cloned());
        self.git(args, cancel).await
    }

    /// Make sure the parent directory of a root-relative path exists
    pub async fn ensure_parent(&self, rel: &str, cancel: &CancellationToken) -> Result<()> {
        if let Some((parent, _)) = rel.rsplit_once('/') {
            let req = self.request(["mkdir", "-p", "--", parent]);
            self.run(&req, cancel).await?;
        }
        Ok(())
    }

    /// Apply permission bits to a remote path, as the privileged user
    pub async fn chmod(&self, rel: &str, mode: u32, cancel: &CancellationToken) -> Result<()> {
        let req = ExecRequest::new([
            "chmod".to_string(),
            format!("{:o}", mode),
            "--".to_string(),
            self.abs(rel),
        ]);
        self.bridge
            .exec_privileged(&self.environment, &req, cancel)
            .await?;
        Ok(())
    }

    /// Whether the commit exists in the remote object database
    pub async fn has_commit(&self, sha: &str, cancel: &CancellationToken) -> Result<bool> {
        let object = format!("{}^{{commit}}", sha);
        match self.git(["cat-file", "-e", object.as_str()], cancel).await {
            Ok(_) => Ok(true),
            Err(Error::Command { code: Some(_), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl WorkTree for RemoteTree {
    fn side(&self) -> Source {
        Source::Remote
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
                let out = self.git(BASE.iter().copied(), cancel).await?;
                Ok(parse_porcelain_z(&out))
            }
            StatusScope::Paths(paths) => {
                let mut entries = Vec::new();
                for chunk in paths.chunks(PATH_CHUNK) {
                    let out = self.git_paths(BASE, chunk, cancel).await?;
                    entries.extend(parse_porcelain_z(&out));
                }
                Ok(entries)
            }
        }
    }

    async fn ignored(
        &self,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let mut ignored = HashSet::new();
        for chunk in paths.chunks(PATH_CHUNK) {
            match self.script(IGNORED_SCRIPT, chunk, cancel).await {
                Ok(out) => ignored.extend(split_nul(&out)),
                // exit 1: none of the paths are ignored
                Err(Error::Command { code: Some(1), .. }) => {}
                Err(e) => return Err(e),
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
                .git_paths(&["--literal-pathspecs", "ls-files", "-z"], chunk, cancel)
                .await?;
            tracked.extend(split_nul(&out));
        }
        Ok(tracked)
    }

    async fn existing(
        &self,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for chunk in paths.chunks(PATH_CHUNK) {
            let out = self.script(EXISTING_SCRIPT, chunk, cancel).await?;
            existing.extend(split_nul(&out));
        }
        Ok(existing)
    }

    async fn blob_hash(&self, path: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let out = self.script(HASH_SCRIPT, &[path.to_string()], cancel).await?;
        let hash = out.trim();
        Ok((!hash.is_empty()).then(|| hash.to_string()))
    }

    async fn remove(&self, path: &str, cancel: &CancellationToken) -> Result<bool> {
        let out = self.script(REMOVE_SCRIPT, &[path.to_string()], cancel).await?;
        Ok(out.trim() == "removed")
    }

    async fn head_state(&self, cancel: &CancellationToken) -> Result<HeadState> {
        let sha = match self.git(["rev-parse", "--verify", "-q", "HEAD"], cancel).await {
            Ok(out) => Some(out.trim().to_string()),
            // unborn branch
            Err(Error::Command { code: Some(1), .. }) => None,
            Err(e) => return Err(e),
        };

        let branch = match self.git(["symbolic-ref", "-q", "--short", "HEAD"], cancel).await {
            Ok(out) => out.trim().to_string(),
            Err(Error::Command { code: Some(1), .. }) => DETACHED.to_string(),
            Err(e) => return Err(e),
        };

        Ok(HeadState { sha, branch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::git::host::tests::{git, init_repo};

    fn local_tree(dir: &std::path::Path) -> RemoteTree {
        RemoteTree::new(
            Arc::new(LocalBridge::new()),
            "local",
            dir.to_string_lossy().into_owned(),
            None,
        )
    }

    #[tokio::test]
    async fn test_remote_blob_hash_and_existing() {
        let repo = init_repo();
        let tree = local_tree(repo.path());
        let cancel = CancellationToken::new();

        let expected = git(repo.path(), &["hash-object", "README.md"]);
        assert_eq!(
            tree.blob_hash("README.md", &cancel).await.unwrap().as_deref(),
            Some(expected.as_str())
        );
        assert_eq!(tree.blob_hash("nope.txt", &cancel).await.unwrap(), None);

        let candidates = vec![
            "README.md".to_string(),
            "nope.txt".to_string(),
            "with space.txt".to_string(),
        ];
        std::fs::write(repo.path().join("with space.txt"), "s").unwrap();
        let existing = tree.existing(&candidates, &cancel).await.unwrap();
        assert!(existing.contains("README.md"));
        assert!(existing.contains("with space.txt"));
        assert!(!existing.contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_remote_head_state_unborn_and_detached() {
        let dir = tempfile::TempDir::new().unwrap();
        git(dir.path(), &["init", "-q", "-b", "trunk"]);
        let tree = local_tree(dir.path());
        let cancel = CancellationToken::new();

        let head = tree.head_state(&cancel).await.unwrap();
        assert_eq!(head.sha, None);
        assert_eq!(head.branch, "trunk");

        let repo = init_repo();
        let tree = local_tree(repo.path());
        git(repo.path(), &["checkout", "-q", "--detach", "HEAD"]);
        let head = tree.head_state(&cancel).await.unwrap();
        assert!(head.is_detached());
        assert!(head.sha.is_some());
        assert!(tree.has_commit(head.sha.as_deref().unwrap(), &cancel).await.unwrap());
        assert!(!tree
            .has_commit("0123456789012345678901234567890123456789", &cancel)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_remote_remove_and_parent() {
        let repo = init_repo();
        let tree = local_tree(repo.path());
        let cancel = CancellationToken::new();

        tree.ensure_parent("deep/nested/file.txt", &cancel).await.unwrap();
        assert!(repo.path().join("deep/nested").is_dir());

        assert!(tree.remove("deep", &cancel).await.unwrap());
        assert!(!tree.remove("deep", &cancel).await.unwrap());
        assert!(!repo.path().join("deep").exists());
    }

    #[tokio::test]
    async fn test_remote_ignored() {
        let repo = init_repo();
        let tree = local_tree(repo.path());
        let cancel = CancellationToken::new();

        std::fs::write(repo.path().join(".gitignore"), "target/\n*.log\n").unwrap();
        std::fs::create_dir_all(repo.path().join("target/debug")).unwrap();
        std::fs::write(repo.path().join("target/debug/app"), "elf").unwrap();
        std::fs::write(repo.path().join("target/keep.txt"), "kept").unwrap();
        git(repo.path(), &["add", "-f", "target/keep.txt"]);
        std::fs::write(repo.path().join("run 1.log"), "log").unwrap();

        let candidates: Vec<String> = [
            "target/debug/app",
            "target/keep.txt",
            "run 1.log",
            "src/main.rs",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let ignored = tree.ignored(&candidates, &cancel).await.unwrap();
        assert_eq!(ignored.len(), 2, "{:?}", ignored);
        assert!(ignored.contains("target/debug/app"));
        assert!(ignored.contains("run 1.log"));

        let none = tree
            .ignored(&["src/main.rs".to_string()], &cancel)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}

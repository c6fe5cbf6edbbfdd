//! Bridge that treats a directory on this machine as the remote environment

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{run_command, ChildProcess, CommandBridge, ExecRequest, RemoteProcess};
use crate::{Error, Result};

/// Runs "remote" commands directly on the host
///
/// The environment identifier is informational only; remote paths are host
/// paths. Users are ignored, every command runs as the current user.
#[derive(Debug, Clone, Default)]
pub struct LocalBridge;

impl LocalBridge {
    /// Create a new local bridge
    pub fn new() -> Self {
        Self
    }

    fn build(request: &ExecRequest) -> Result<Command> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| Error::Config("Empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        Ok(cmd)
    }
}

async fn copy_file(from: &Path, to: &Path, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = tokio::fs::copy(from, to) => res.map(|_| ()).map_err(Error::Io),
    }
}

#[async_trait]
impl CommandBridge for LocalBridge {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn exec(
        &self,
        _environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cmd = Self::build(request)?;
        run_command(cmd, request.program(), cancel).await
    }

    async fn exec_privileged(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.exec(environment, request, cancel).await
    }

    async fn copy_to_remote(
        &self,
        _environment: &str,
        host_path: &Path,
        remote_path: &str,
        _preserve_ownership: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        copy_file(host_path, Path::new(remote_path), cancel).await
    }

    async fn copy_from_remote(
        &self,
        _environment: &str,
        remote_path: &str,
        host_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        copy_file(Path::new(remote_path), host_path, cancel).await
    }

    async fn spawn_streaming(
        &self,
        _environment: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>> {
        let cmd = Self::build(request)?;
        Ok(Box::new(ChildProcess::spawn(cmd, request.program())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_exec_in_workdir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();

        let req = ExecRequest::new(["ls"]).workdir(dir.path().to_string_lossy());
        let out = LocalBridge::new()
            .exec("local", &req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "marker");
    }

    #[tokio::test]
    async fn test_exec_passes_env() {
        let req = ExecRequest::new(["sh", "-c", "printf %s \"$TETHER_VALUE\""])
            .env("TETHER_VALUE", "42");
        let out = LocalBridge::new()
            .exec("local", &req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "42");
    }

    #[tokio::test]
    async fn test_copy_round_trip() {
        let host = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let src = host.path().join("a.txt");
        std::fs::write(&src, "hello").unwrap();

        let bridge = LocalBridge::new();
        let cancel = CancellationToken::new();
        let remote_path = remote.path().join("a.txt");
        bridge
            .copy_to_remote("local", &src, &remote_path.to_string_lossy(), false, &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&remote_path).unwrap(), "hello");

        let missing = bridge
            .copy_from_remote("local", "/nonexistent/tether/file", &src, &cancel)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let req = ExecRequest::default();
        let result = LocalBridge::new()
            .exec("local", &req, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

//! Docker CLI bridge

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{run_command, ChildProcess, CommandBridge, ExecRequest, RemoteProcess};
use crate::{Error, Result};

/// User docker runs privileged commands as
const PRIVILEGED_USER: &str = "root";

/// Bridge that drives a container with `docker exec` and `docker cp`
#[derive(Debug, Clone)]
pub struct DockerBridge {
    docker_path: String,
    /// Default unprivileged user for exec and ownership of copied files
    user: Option<String>,
}

impl DockerBridge {
    /// Create a new docker bridge with default settings
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
            user: None,
        }
    }

    /// Use a custom docker executable
    pub fn with_docker_path(mut self, path: impl Into<String>) -> Self {
        self.docker_path = path.into();
        self
    }

    /// Run unprivileged commands as this user
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Build the `docker exec` command line for a request
    fn build_exec(&self, environment: &str, request: &ExecRequest, user: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.docker_path);
        cmd.args(exec_args(environment, request, user));
        cmd
    }

    fn effective_user<'a>(&'a self, request: &'a ExecRequest) -> Option<&'a str> {
        request.user.as_deref().or(self.user.as_deref())
    }
}

impl Default for DockerBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments after `docker` for an exec request
fn exec_args(environment: &str, request: &ExecRequest, user: Option<&str>) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(u) = user {
        args.push("-u".to_string());
        args.push(u.to_string());
    }
    if let Some(dir) = &request.workdir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    for (k, v) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", k, v));
    }
    args.push(environment.to_string());
    args.extend(request.argv.iter().cloned());
    args
}

#[async_trait]
impl CommandBridge for DockerBridge {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn exec(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cmd = self.build_exec(environment, request, self.effective_user(request));
        run_command(cmd, request.program(), cancel).await
    }

    async fn exec_privileged(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cmd = self.build_exec(environment, request, Some(PRIVILEGED_USER));
        run_command(cmd, request.program(), cancel).await
    }

    async fn copy_to_remote(
        &self,
        environment: &str,
        host_path: &Path,
        remote_path: &str,
        preserve_ownership: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("cp");
        if preserve_ownership {
            cmd.arg("-a");
        }
        cmd.arg(host_path).arg(format!("{}:{}", environment, remote_path));
        run_command(cmd, "docker cp", cancel).await?;

        // docker cp lands files as root; hand them to the application user
        if !preserve_ownership {
            if let Some(user) = &self.user {
                let chown = ExecRequest::new(["chown", user.as_str(), "--", remote_path]);
                self.exec_privileged(environment, &chown, cancel).await?;
            }
        }

        Ok(())
    }

    async fn copy_from_remote(
        &self,
        environment: &str,
        remote_path: &str,
        host_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.docker_path);
        cmd.arg("cp")
            .arg(format!("{}:{}", environment, remote_path))
            .arg(host_path);
        run_command(cmd, "docker cp", cancel).await?;
        Ok(())
    }

    async fn spawn_streaming(
        &self,
        environment: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>> {
        if request.argv.is_empty() {
            return Err(Error::Watch("Empty command for streaming exec".to_string()));
        }
        let cmd = self.build_exec(environment, request, self.effective_user(request));
        let process = ChildProcess::spawn(cmd, request.program())?;
        Ok(Box::new(process))
    }
}

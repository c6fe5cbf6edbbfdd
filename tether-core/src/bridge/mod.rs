//! Command bridge to the remote environment
//!
//! Every component that touches the remote side goes through [`CommandBridge`]:
//! exec with or without privileges, file copies in both directions, and a
//! long-lived streaming process used by the remote watcher.

mod docker;
mod local;
#[cfg(test)]
pub(crate) mod testing;

pub use docker::DockerBridge;
pub use local::LocalBridge;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{BridgeKind, RemoteConfig};
use crate::{Error, Result};

/// A command to run inside the remote environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Working directory inside the remote environment
    pub workdir: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// User to run as (bridge default when unset)
    pub user: Option<String>,
}

impl ExecRequest {
    /// Create a request for the given argv
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Run in the given working directory
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run as a specific user
    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Name of the program, for error messages
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("<empty>")
    }
}

/// A long-lived process whose stdout is consumed line by line
#[async_trait]
pub trait RemoteProcess: Send {
    /// Next stdout line, or `None` at EOF
    ///
    /// Must be cancel-safe so it can sit in a `select!`.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Kill the process and reap it within `grace`
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Exec/copy access to one remote environment
#[async_trait]
pub trait CommandBridge: Send + Sync {
    /// Get the name of this bridge
    fn name(&self) -> &'static str;

    /// Run a command and return its stdout
    async fn exec(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Run a command as the privileged user
    async fn exec_privileged(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Copy a host file into the remote environment
    async fn copy_to_remote(
        &self,
        environment: &str,
        host_path: &Path,
        remote_path: &str,
        preserve_ownership: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Copy a remote file onto the host
    async fn copy_from_remote(
        &self,
        environment: &str,
        remote_path: &str,
        host_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Start a streaming process inside the remote environment
    async fn spawn_streaming(
        &self,
        environment: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>>;
}

/// Build the bridge selected by configuration
pub fn from_config(config: &RemoteConfig) -> Arc<dyn CommandBridge> {
    match config.bridge {
        BridgeKind::Docker => Arc::new(
            DockerBridge::new()
                .with_docker_path(config.docker_path.clone())
                .with_user(config.user.clone()),
        ),
        BridgeKind::Local => Arc::new(LocalBridge::new()),
    }
}

/// Run a prepared command to completion, returning stdout
///
/// The child is killed if `cancel` fires first.
pub(crate) async fn run_command(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let executable = cmd.as_std().get_program().to_string_lossy().into_owned();
    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Config(format!("Executable not found: '{}'", executable))
        } else {
            Error::Io(e)
        }
    })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        out = child.wait_with_output() => out.map_err(Error::Io)?,
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::command(
            program,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// [`RemoteProcess`] backed by a local child process
pub struct ChildProcess {
    /// The child process (not Debug, so we skip it)
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    program: String,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("program", &self.program)
            .field("child", &"<Child>")
            .finish()
    }
}

impl ChildProcess {
    /// Spawn `cmd` with stdout piped
    pub fn spawn(mut cmd: Command, program: &str) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Watch(format!("Executable not found: '{}'", program))
            } else {
                Error::Io(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Watch(format!("No stdout from '{}'", program)))?;

        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
            program: program.to_string(),
        })
    }
}

#[async_trait]
impl RemoteProcess for ChildProcess {
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines.next_line().await.map_err(Error::Io)
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the child already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(Error::Io(e));
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status.map_err(Error::Io)?;
                tracing::debug!(program = %self.program, %status, "Streaming process reaped");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(format!(
                "'{}' did not exit within {:?}",
                self.program, grace
            ))),
        }
    }
}

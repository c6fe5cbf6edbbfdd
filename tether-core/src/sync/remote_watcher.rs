//! Remote watcher: one long-lived recursive watch process in the remote environment

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::paths::remote_relative;
use super::{PathChangeEvent, Source};
use crate::bridge::{CommandBridge, ExecRequest, RemoteProcess};
use crate::{Error, Result};

/// Prints the shell pid, then replaces the shell with the watch binary
///
/// `$0` is the binary, `$1` the exclude regex, `$2` the directory.
const WATCH_SCRIPT: &str = concat!(
    r#"echo $$; exec "$0" -m -r -q"#,
    " -e close_write -e create -e delete -e moved_from -e moved_to -e attrib",
    r#" --exclude "$1" --format '%w%f|%e' "$2""#,
);

/// Skips the metadata directory at any depth
const EXCLUDE_REGEX: &str = r"(^|/)\.git(/|$)";

const LOOKUP_SCRIPT: &str = r#"command -v "$0""#;

/// Event reported by the remote watch process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// File closed after writing
    Write,
    /// Path created
    Create,
    /// Path deleted
    Delete,
    /// Moved away from this path
    MovedFrom,
    /// Moved onto this path
    MovedTo,
    /// Metadata such as permissions changed
    Attrib,
}

impl WatchEventKind {
    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "CLOSE_WRITE" => Some(Self::Write),
            "CREATE" => Some(Self::Create),
            "DELETE" | "DELETE_SELF" => Some(Self::Delete),
            "MOVED_FROM" | "MOVE_SELF" => Some(Self::MovedFrom),
            "MOVED_TO" => Some(Self::MovedTo),
            "ATTRIB" => Some(Self::Attrib),
            _ => None,
        }
    }
}

/// Parse one `path|FLAG,FLAG` line into the path and its event kind
///
/// The path is split at the last `|` so paths containing `|` survive.
pub fn parse_watch_line(line: &str) -> Option<(String, WatchEventKind)> {
    let (path, flags) = line.trim_end_matches(['\r', '\n']).rsplit_once('|')?;
    if path.is_empty() {
        return None;
    }
    let kind = flags.split(',').find_map(WatchEventKind::from_flag)?;
    Some((path.to_string(), kind))
}

/// Emits remote path events into the shared queue
#[derive(Clone)]
pub struct RemoteWatcher {
    bridge: Arc<dyn CommandBridge>,
    environment: String,
    root: String,
    user: Option<String>,
    binary: String,
    grace: Duration,
    debug: bool,
}

impl std::fmt::Debug for RemoteWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWatcher")
            .field("bridge", &self.bridge.name())
            .field("environment", &self.environment)
            .field("root", &self.root)
            .field("binary", &self.binary)
            .finish()
    }
}

impl RemoteWatcher {
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
            binary: "inotifywait".to_string(),
            grace: Duration::from_secs(2),
            debug: false,
        }
    }

    /// Use a different watch binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Grace period for stopping the watch process
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Log discarded lines
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check that the watch binary exists in the remote environment
    pub async fn preflight(&self, cancel: &CancellationToken) -> Result<()> {
        let req = ExecRequest::new(["sh", "-c", LOOKUP_SCRIPT, self.binary.as_str()]);
        match self.bridge.exec(&self.environment, &req, cancel).await {
            Ok(_) => Ok(()),
            Err(Error::Command { code: Some(_), .. }) => Err(Error::Watch(format!(
                "'{}' is not installed in environment '{}'. Install inotify-tools in the image to enable sync.",
                self.binary, self.environment
            ))),
            Err(e) => Err(e),
        }
    }

    /// Start the watch process and stream its events until cancellation
    pub async fn run(
        &self,
        events: mpsc::Sender<PathChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let argv = [
            "sh",
            "-c",
            WATCH_SCRIPT,
            self.binary.as_str(),
            EXCLUDE_REGEX,
            self.root.as_str(),
        ];
        let req = ExecRequest::new(argv)
            .workdir(self.root.clone())
            .user(self.user.clone());
        let mut process = self.bridge.spawn_streaming(&self.environment, &req).await?;

        let first = tokio::select! {
            _ = cancel.cancelled() => {
                self.shutdown(process.as_mut(), None).await;
                return Ok(());
            }
            line = process.next_line() => line,
        };
        let pid = match first {
            Ok(Some(line)) => line.trim().parse::<u32>().ok(),
            Ok(None) => {
                self.shutdown(process.as_mut(), None).await;
                return Err(Error::Watch(format!(
                    "Remote watch process in '{}' exited before starting",
                    self.environment
                )));
            }
            Err(e) => {
                self.shutdown(process.as_mut(), None).await;
                return Err(Error::Watch(format!(
                    "Failed to read from remote watch process: {}",
                    e
                )));
            }
        };
        if pid.is_none() {
            warn!("Remote watch process did not report its pid");
        }

        info!(environment = %self.environment, root = %self.root, "Watching remote working tree");
        self.stream(process, pid, events, cancel).await
    }

    /// Consume an already started watch process
    pub async fn stream(
        &self,
        mut process: Box<dyn RemoteProcess>,
        pid: Option<u32>,
        events: mpsc::Sender<PathChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown(process.as_mut(), pid).await;
                    return Ok(());
                }
                line = process.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.shutdown(process.as_mut(), pid).await;
                    return Err(Error::Watch(format!(
                        "Remote watch process in '{}' exited unexpectedly",
                        self.environment
                    )));
                }
                Err(e) => {
                    self.shutdown(process.as_mut(), pid).await;
                    return Err(Error::Watch(format!("Remote watch stream failed: {}", e)));
                }
            };

            let Some(rel) = self.relative_path(&line) else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown(process.as_mut(), pid).await;
                    return Ok(());
                }
                sent = events.send(PathChangeEvent::new(Source::Remote, rel)) => {
                    if sent.is_err() {
                        debug!("Event queue closed, stopping remote watcher");
                        self.shutdown(process.as_mut(), pid).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn relative_path(&self, line: &str) -> Option<String> {
        let Some((path, _kind)) = parse_watch_line(line) else {
            if self.debug {
                debug!(line = %line, "Discarding unparsable watch line");
            }
            return None;
        };
        remote_relative(&self.root, &path)
    }

    /// Kill the watcher inside the remote environment, then reap the local end
    async fn shutdown(&self, process: &mut dyn RemoteProcess, pid: Option<u32>) {
        if let Some(pid) = pid.filter(|p| *p > 1) {
            // The session token is already cancelled; use a fresh one bounded by the grace period
            let kill_cancel = CancellationToken::new();
            let req = ExecRequest::new(["kill".to_string(), pid.to_string()]);
            let killed = tokio::time::timeout(
                self.grace,
                self.bridge.exec_privileged(&self.environment, &req, &kill_cancel),
            )
            .await;
            match killed {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(pid, "Failed to kill remote watch process: {}", e),
                Err(_) => {
                    kill_cancel.cancel();
                    debug!(pid, "Timed out killing remote watch process");
                }
            }
        }

        if let Err(e) = process.terminate(self.grace).await {
            warn!("Failed to reap remote watch process: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted stand-in for a remote watch process
    struct ScriptedProcess {
        lines: VecDeque<String>,
        hold_open: bool,
        terminated: Arc<AtomicBool>,
    }

    impl ScriptedProcess {
        fn new(lines: &[&str], hold_open: bool) -> (Box<dyn RemoteProcess>, Arc<AtomicBool>) {
            let terminated = Arc::new(AtomicBool::new(false));
            let process = Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                hold_open,
                terminated: Arc::clone(&terminated),
            };
            (Box::new(process), terminated)
        }
    }

    #[async_trait]
    impl RemoteProcess for ScriptedProcess {
        async fn next_line(&mut self) -> Result<Option<String>> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                None if self.hold_open => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out one scripted watch process; every other call fails
    struct ScriptedBridge(std::sync::Mutex<Option<Box<dyn RemoteProcess>>>);

    fn unscripted() -> Error {
        Error::Config("not scripted".to_string())
    }

    #[async_trait]
    impl CommandBridge for ScriptedBridge {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn exec(
            &self,
            _environment: &str,
            _request: &ExecRequest,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            Err(unscripted())
        }

        async fn exec_privileged(
            &self,
            _environment: &str,
            _request: &ExecRequest,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            Err(unscripted())
        }

        async fn copy_to_remote(
            &self,
            _environment: &str,
            _host_path: &std::path::Path,
            _remote_path: &str,
            _preserve_ownership: bool,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Err(unscripted())
        }

        async fn copy_from_remote(
            &self,
            _environment: &str,
            _remote_path: &str,
            _host_path: &std::path::Path,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Err(unscripted())
        }

        async fn spawn_streaming(
            &self,
            _environment: &str,
            _request: &ExecRequest,
        ) -> Result<Box<dyn RemoteProcess>> {
            self.0.lock().unwrap().take().ok_or_else(unscripted)
        }
    }

    fn watcher() -> RemoteWatcher {
        RemoteWatcher::new(Arc::new(LocalBridge::new()), "web", "/app", Some("app".to_string()))
            .with_grace(Duration::from_millis(200))
    }

    #[test]
    fn test_parse_watch_line() {
        assert_eq!(
            parse_watch_line("/app/lib/x.rb|CLOSE_WRITE,CLOSE"),
            Some(("/app/lib/x.rb".to_string(), WatchEventKind::Write))
        );
        assert_eq!(
            parse_watch_line("/app/a|b.txt|MOVED_TO"),
            Some(("/app/a|b.txt".to_string(), WatchEventKind::MovedTo))
        );
        assert_eq!(
            parse_watch_line("/app/tmp|CREATE,ISDIR"),
            Some(("/app/tmp".to_string(), WatchEventKind::Create))
        );
        assert_eq!(parse_watch_line("garbage"), None);
        assert_eq!(parse_watch_line("|DELETE"), None);
        assert_eq!(parse_watch_line("/app/x|OPEN"), None);
    }

    #[tokio::test]
    async fn test_stream_forwards_relative_paths() {
        let (process, terminated) = ScriptedProcess::new(
            &[
                "/app/config/old.yml|DELETE",
                "/app/.git/index|CLOSE_WRITE,CLOSE",
                "not a watch line",
                "/app/app/models/user.rb|CLOSE_WRITE,CLOSE",
            ],
            true,
        );
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let w = watcher();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { w.stream(process, None, tx, cancel).await })
        };

        assert_eq!(
            rx.recv().await.unwrap(),
            PathChangeEvent::new(Source::Remote, "config/old.yml")
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PathChangeEvent::new(Source::Remote, "app/models/user.rb")
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_fatal() {
        let (process, terminated) = ScriptedProcess::new(&["/app/a.txt|CREATE"], false);
        let (tx, _rx) = mpsc::channel(8);
        let err = watcher()
            .stream(process, None, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
        assert!(terminated.load(Ordering::SeqCst), "exited process must still be reaped");
    }

    #[tokio::test]
    async fn test_exit_before_pid_line_reaps_process() {
        let (process, terminated) = ScriptedProcess::new(&[], false);
        let bridge = ScriptedBridge(std::sync::Mutex::new(Some(process)));
        let w = RemoteWatcher::new(Arc::new(bridge), "web", "/app", None);
        let (tx, _rx) = mpsc::channel(8);

        let err = w.run(tx, CancellationToken::new()).await.unwrap_err();
        match err {
            Error::Watch(msg) => assert!(msg.contains("exited before starting"), "{}", msg),
            other => panic!("Expected Watch error, got {other:?}"),
        }
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_preflight_reports_missing_binary() {
        let w = watcher().with_binary("tether-no-such-watcher");
        let err = w.preflight(&CancellationToken::new()).await.unwrap_err();
        match err {
            Error::Watch(msg) => assert!(msg.contains("tether-no-such-watcher")),
            other => panic!("Expected Watch error, got {other:?}"),
        }

        watcher().with_binary("sh").preflight(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_reads_pid_then_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        // Stand-in binary that prints one event in inotifywait's format and waits
        let fake = dir.path().join("fake-watch");
        std::fs::write(
            &fake,
            format!("#!/bin/sh\necho '{}/hello.txt|CREATE'\nexec sleep 30\n", root),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let w = RemoteWatcher::new(Arc::new(LocalBridge::new()), "local", root, None)
            .with_binary(fake.to_string_lossy().into_owned())
            .with_grace(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { w.run(tx, cancel).await })
        };

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PathChangeEvent::new(Source::Remote, "hello.txt"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

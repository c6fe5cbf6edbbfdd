//! Bridge double that injects failures in front of [`LocalBridge`]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandBridge, ExecRequest, LocalBridge, RemoteProcess};
use crate::{Error, Result};

type CopyFault = Box<dyn Fn(&str) -> Option<Error> + Send + Sync>;
type ExecHang = Box<dyn Fn(&ExecRequest) -> bool + Send + Sync>;

/// Local bridge with scripted copy failures and hung execs
#[derive(Default)]
pub(crate) struct FaultyBridge {
    inner: LocalBridge,
    copy_fault: Option<CopyFault>,
    exec_hang: Option<ExecHang>,
    copies_to_remote: AtomicUsize,
    hung_execs: AtomicUsize,
}

impl FaultyBridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail `copy_to_remote` with the returned error for matching remote paths
    pub(crate) fn failing_copy_to_remote(
        mut self,
        fault: impl Fn(&str) -> Option<Error> + Send + Sync + 'static,
    ) -> Self {
        self.copy_fault = Some(Box::new(fault));
        self
    }

    /// Block matching execs until their cancellation token fires
    pub(crate) fn hanging_exec(
        mut self,
        hang: impl Fn(&ExecRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exec_hang = Some(Box::new(hang));
        self
    }

    /// Attempted copies into the remote, failed ones included
    pub(crate) fn copies_to_remote(&self) -> usize {
        self.copies_to_remote.load(Ordering::SeqCst)
    }

    /// Execs that were left hanging
    pub(crate) fn hung_execs(&self) -> usize {
        self.hung_execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandBridge for FaultyBridge {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn exec(
        &self,
        environment: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.exec_hang.as_ref().is_some_and(|hang| hang(request)) {
            self.hung_execs.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }
        self.inner.exec(environment, request, cancel).await
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
        environment: &str,
        host_path: &Path,
        remote_path: &str,
        preserve_ownership: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.copies_to_remote.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.copy_fault.as_ref().and_then(|fault| fault(remote_path)) {
            return Err(err);
        }
        self.inner
            .copy_to_remote(environment, host_path, remote_path, preserve_ownership, cancel)
            .await
    }

    async fn copy_from_remote(
        &self,
        environment: &str,
        remote_path: &str,
        host_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner
            .copy_from_remote(environment, remote_path, host_path, cancel)
            .await
    }

    async fn spawn_streaming(
        &self,
        environment: &str,
        request: &ExecRequest,
    ) -> Result<Box<dyn RemoteProcess>> {
        self.inner.spawn_streaming(environment, request).await
    }
}

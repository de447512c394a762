//! Conformance run lifecycle
//!
//! [`TestRunner`] owns the cluster handle and the run configuration. Each
//! stage of a run lives in its own file as an `impl` block:
//!
//! - `deploy`: namespace, RBAC, repo-list ConfigMap and workload creation
//! - `readiness`: wait for the workload to leave `Pending`
//! - `stream`: the log stream coordinator and its consumer
//! - `download`: copy result files out of the output container
//! - `exit_code`: read the test container's exit code
//! - `cleanup`: delete cluster-scoped RBAC and the namespace
//! - `list_images`: one-off pod listing the images the suite uses
//!
//! # Errors
//!
//! Every stage has its own error type; [`RunError`] wraps them for callers
//! that drive the full lifecycle.

mod cleanup;
mod deploy;
mod download;
mod exit_code;
mod list_images;
mod readiness;
mod stream;

pub use cleanup::CleanupError;
pub use deploy::{DeployError, DeployReport};
pub use download::DownloadError;
pub use exit_code::{test_container_exit_code, ExitStatus};
pub use stream::{LogStream, LogStreamCoordinator, StreamError, StreamMessage, StreamSettings};

use crate::cluster::{ClusterApi, ClusterError};
use crate::config::{default_conformance_image, ConfigError, RunConfig};
use crate::progress::ProgressError;
use crate::wait::WaitError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that end a conformance run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("waiting on the workload failed: {0}")]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("failed to set up progress parsing: {0}")]
    Progress(#[from] ProgressError),

    #[error("failed to write test output: {0}")]
    Output(#[from] std::io::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("run was cancelled")]
    Cancelled,
}

/// Drives one conformance run against a cluster
pub struct TestRunner<C> {
    cluster: Arc<C>,
    config: RunConfig,
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    pub fn new(cluster: Arc<C>, config: RunConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// The configured conformance image, or the one matching the server
    pub async fn conformance_image(&self) -> Result<String, RunError> {
        if let Some(image) = &self.config.conformance_image {
            return Ok(image.clone());
        }

        let version = self.cluster.server_version().await?;
        Ok(default_conformance_image(&version)?)
    }

    /// Log what is about to run
    pub async fn log_summary(&self, image: &str) {
        match self.cluster.server_version().await {
            Ok(version) => info!(version = %version, "API server"),
            Err(e) => warn!(error = %e, "Could not read API server version"),
        }

        info!(
            namespace = %self.config.namespace,
            conformance_image = %image,
            busybox_image = %self.config.busybox_image,
            "Conformance run"
        );
        info!(
            focus = %self.config.focus,
            skip = %self.config.skip,
            dry_run = self.config.dry_run,
            parallel = self.config.parallel,
            verbosity = self.config.verbosity,
            "Test selection"
        );
    }

    /// Run the whole lifecycle and return the suite's exit status.
    ///
    /// Test output is written to `out`. Cleanup is attempted even when an
    /// earlier stage failed; the first error is the one returned.
    pub async fn run<W>(&self, out: &mut W, cancel: CancellationToken) -> Result<ExitStatus, RunError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let image = self.conformance_image().await?;
        self.log_summary(&image).await;

        let result = self.run_workload(&image, out, &cancel).await;

        if let Err(e) = &result {
            error!(error = %e, "Conformance run failed, cleaning up");
        }

        // Cleanup gets its own token so an interrupt still removes what was created
        let cleanup = self.cleanup(CancellationToken::new()).await;

        match (result, cleanup) {
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(error = %cleanup_err, "Cleanup after failed run also failed");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(status), Ok(())) => Ok(status),
        }
    }

    async fn run_workload<W>(
        &self,
        image: &str,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus, RunError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        self.deploy(image).await?;
        self.wait_for_workload(cancel.clone()).await?;
        self.stream_logs(out, cancel.clone()).await?;

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        if let Err(e) = self.download_results().await {
            // Artifacts are a convenience; the exit code still decides the run
            error!(error = %e, "Failed to download results");
        }

        let status = self.exit_code(cancel.clone()).await?;
        info!(exit_code = status.process_code(), "Conformance tests finished");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{self, FakeCluster, LogScript};
    use crate::cluster::{ClusterObject, ExecOutput, ObjectKind, ObjectRef};
    use crate::manifests::{CONFORMANCE_CONTAINER, POD_NAME};
    use kube::api::WatchEvent;
    use std::time::Duration;

    pub(super) fn runner(cluster: &Arc<FakeCluster>) -> TestRunner<FakeCluster> {
        let config = RunConfig::new()
            .conformance_image("registry.k8s.io/conformance:v1.31.2")
            .disable_progress_status(true)
            .completion_check(2, Duration::from_secs(1))
            .reconnect(2, Duration::from_secs(1));
        TestRunner::new(Arc::clone(cluster), config)
    }

    #[tokio::test]
    async fn test_conformance_image_defaults_to_server_version() {
        let cluster = Arc::new(FakeCluster::new());
        let runner = TestRunner::new(Arc::clone(&cluster), RunConfig::new());

        assert_eq!(
            runner.conformance_image().await.unwrap(),
            "registry.k8s.io/conformance:v1.31.2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_returns_exit_code_and_cleans_up() {
        let cluster = Arc::new(FakeCluster::new());
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(
            Arc::clone(&cluster),
            runner(&cluster).config().clone().output_dir(dir.path()),
        );

        let running = fake::pod("conformance", POD_NAME, "Running", vec![(CONFORMANCE_CONTAINER, fake::running())]);
        let finished = fake::pod(
            "conformance",
            POD_NAME,
            "Running",
            vec![(CONFORMANCE_CONTAINER, fake::terminated(1, "Completed"))],
        );

        // readiness, then exit code
        cluster.push_pod_watch(vec![WatchEvent::Added(running)], true);
        cluster.push_pod_watch(vec![WatchEvent::Added(finished)], true);
        cluster.push_follow_log(LogScript::Lines {
            lines: vec!["Will run 1 of 1 specs".to_string(), "•".to_string()],
            hang: false,
        });
        cluster.push_tail_log(&["Ginkgo ran 1 suite in 3m"]);
        cluster.push_exec(Ok(ExecOutput {
            stdout: "log".to_string(),
            stderr: String::new(),
        }));
        cluster.push_exec(Ok(ExecOutput {
            stdout: "<testsuites/>".to_string(),
            stderr: String::new(),
        }));
        cluster.push_namespace_watch(vec![WatchEvent::Deleted(fake::namespace("conformance"))], true);

        let mut out = Vec::new();
        let status = runner.run(&mut out, CancellationToken::new()).await.unwrap();

        assert_eq!(status, ExitStatus::Code(1));
        assert_eq!(String::from_utf8(out).unwrap(), "Will run 1 of 1 specs\n•\n");
        assert_eq!(cluster.object_count(), 0);
        assert!(dir.path().join("junit_01.xml").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_deploy_still_cleans_up() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_create(ObjectKind::Pod, ClusterError::Api("admission webhook denied".to_string()));
        cluster.push_namespace_watch(vec![WatchEvent::Deleted(fake::namespace("conformance"))], true);

        let runner = runner(&cluster);
        let err = runner
            .run(&mut Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Deploy(DeployError::Create { .. })));
        assert!(cluster
            .deleted()
            .contains(&ObjectRef::cluster(ObjectKind::Namespace, "conformance")));
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert(ClusterObject::Namespace(fake::namespace("unrelated")));
        let runner = TestRunner::new(
            Arc::clone(&cluster),
            RunConfig::new().extra_arg("not-a-flag"),
        );

        let err = runner
            .run(&mut Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Config(_)));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wait_error_message_is_neutral() {
        let cluster = Arc::new(FakeCluster::new());

        let err: RunError = runner(&cluster)
            .exit_code(CancellationToken::new())
            .await
            .unwrap_err()
            .into();

        let message = err.to_string();
        assert!(message.starts_with("waiting on the workload failed"), "{message}");
        assert!(!message.contains("did not start"));
    }
}

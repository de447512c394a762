use super::readiness::watch_failed;
use super::TestRunner;
use crate::cluster::ClusterApi;
use crate::manifests::{CONFORMANCE_CONTAINER, POD_NAME};
use crate::wait::{pod_phase, WaitError, Waiter};
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit status of the conformance suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exit code of the terminated test container
    Code(i32),
    /// The watch ended before the test container was seen terminated
    Indeterminate,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        *self == Self::Code(0)
    }

    /// Process exit code; indeterminate maps to 255
    pub fn process_code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Indeterminate => 255,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Indeterminate => f.write_str("indeterminate"),
        }
    }
}

/// Exit code of the test container once it has terminated
///
/// The pod may still report `Running` here because the output container
/// stays up; a terminated test container is final either way.
pub fn test_container_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == CONFORMANCE_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Succeeded" | "Failed") || test_container_exit_code(pod).is_some()
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Watch the workload until the test container has terminated and
    /// return its exit code
    pub async fn exit_code(&self, cancel: CancellationToken) -> Result<ExitStatus, WaitError> {
        let resource = format!("pod/{POD_NAME}");
        let cluster = self.cluster.as_ref();
        let namespace = self.namespace();
        let events = cluster
            .watch_pods(namespace, POD_NAME, None)
            .await
            .map_err(|e| watch_failed(&resource, e))?;

        let observed = Waiter::new(resource)
            .no_timeout()
            .ignore_failures()
            .cancel_on(cancel)
            .until(
                events,
                |version| cluster.watch_pods(namespace, POD_NAME, version),
                |_, pod| is_terminal(pod),
            )
            .await?;

        if !observed.is_matched() {
            warn!(pod = %POD_NAME, "Pod watch ended before the tests finished");
            return Ok(ExitStatus::Indeterminate);
        }

        match observed.into_object().as_ref().and_then(test_container_exit_code) {
            Some(code) => {
                debug!(pod = %POD_NAME, exit_code = code, "Test container terminated");
                Ok(ExitStatus::Code(code))
            }
            None => {
                warn!(pod = %POD_NAME, "Pod finished without a test container status");
                Ok(ExitStatus::Indeterminate)
            }
        }
    }
}

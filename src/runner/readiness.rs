use super::TestRunner;
use crate::cluster::{ClusterApi, ClusterError};
use crate::manifests::POD_NAME;
use crate::wait::{pod_phase, Observed, WaitError, Waiter};
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) fn watch_failed(resource: &str, e: ClusterError) -> WaitError {
    WaitError::Watch {
        resource: resource.to_string(),
        message: e.to_string(),
    }
}

/// Watch a pod until it leaves `Pending`, failing fast on broken containers
pub(super) async fn wait_for_pod_start<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    name: &str,
    waiter: Waiter,
) -> Result<Option<Pod>, WaitError> {
    let resource = format!("pod/{name}");
    let events = cluster
        .watch_pods(namespace, name, None)
        .await
        .map_err(|e| watch_failed(&resource, e))?;

    let reopen = |version| cluster.watch_pods(namespace, name, version);
    match waiter.until(events, reopen, |_, pod| pod_phase(pod) != "Pending").await? {
        Observed::Matched(pod) => Ok(Some(pod)),
        Observed::Closed(last) => {
            warn!(pod = %name, "Pod watch closed before the pod started, continuing");
            Ok(last)
        }
    }
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Wait for the workload to leave `Pending`.
    ///
    /// Image pull failures and crash loops abort immediately instead of
    /// running into the startup timeout.
    pub async fn wait_for_workload(&self, cancel: CancellationToken) -> Result<Option<Pod>, WaitError> {
        let timeout = self.config.startup_timeout;
        info!(namespace = %self.namespace(), timeout = ?timeout, "Waiting for Pod to start");

        let waiter = Waiter::new(format!("pod/{POD_NAME}"))
            .timeout(timeout)
            .cancel_on(cancel);

        let pod = wait_for_pod_start(self.cluster.as_ref(), self.namespace(), POD_NAME, waiter).await?;

        if let Some(pod) = &pod {
            debug!(pod = %POD_NAME, phase = %pod_phase(pod), "Pod started");
        }
        Ok(pod)
    }
}

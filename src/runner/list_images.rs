use super::readiness::{wait_for_pod_start, watch_failed};
use super::{RunError, TestRunner};
use crate::cluster::{ClusterApi, ClusterObject, LogOptions, ObjectRef};
use crate::manifests::{self, CONFORMANCE_CONTAINER, LIST_IMAGES_NAMESPACE};
use crate::wait::{pod_phase, Waiter};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Run the conformance image with `--list-images` and return the images
    /// it reports, sorted. The pod is deleted afterwards in every case.
    pub async fn list_images(&self, image: &str, cancel: CancellationToken) -> Result<Vec<String>, RunError> {
        let pod = self
            .cluster
            .create(ClusterObject::Pod(manifests::list_images_pod(image)))
            .await?;
        info!(pod = %pod.name, namespace = LIST_IMAGES_NAMESPACE, "Created Pod");

        let result = self.collect_images(&pod, cancel).await;

        if let Err(e) = self.cluster.delete(&pod).await {
            error!(pod = %pod.name, error = %e, "Failed to delete Pod");
        }

        result
    }

    async fn collect_images(&self, pod: &ObjectRef, cancel: CancellationToken) -> Result<Vec<String>, RunError> {
        let starting = Waiter::new(format!("pod/{}", pod.name))
            .timeout(self.config.startup_timeout)
            .cancel_on(cancel.clone());
        wait_for_pod_start(self.cluster.as_ref(), LIST_IMAGES_NAMESPACE, &pod.name, starting).await?;

        info!(pod = %pod.name, "Waiting for Pod to complete");

        let resource = format!("pod/{}", pod.name);
        let cluster = self.cluster.as_ref();
        let events = cluster
            .watch_pods(LIST_IMAGES_NAMESPACE, &pod.name, None)
            .await
            .map_err(|e| watch_failed(&resource, e))?;

        let finished = Waiter::new(resource)
            .no_timeout()
            .cancel_on(cancel)
            .until(
                events,
                |version| cluster.watch_pods(LIST_IMAGES_NAMESPACE, &pod.name, version),
                |_, p| matches!(pod_phase(p), "Succeeded" | "Failed"),
            )
            .await?;

        if let Some(p) = finished.into_object() {
            info!(pod = %pod.name, phase = %pod_phase(&p), "Pod completed");
        }

        let lines: Vec<String> = self
            .cluster
            .log_lines(
                LIST_IMAGES_NAMESPACE,
                &pod.name,
                CONFORMANCE_CONTAINER,
                LogOptions::default(),
            )
            .await?
            .try_collect()
            .await?;

        let mut images: Vec<String> = lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        images.sort();
        Ok(images)
    }
}

use super::TestRunner;
use crate::cluster::{ClusterApi, ClusterError, ObjectKind, ObjectRef};
use crate::manifests::rbac::namespaced_name;
use crate::manifests::{CLUSTER_ROLE_BINDING_NAME, CLUSTER_ROLE_NAME};
use crate::wait::{EventKind, Observed, WaitError, Waiter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from removing the run's resources
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to delete {object}: {source}")]
    Delete {
        object: ObjectRef,
        #[source]
        source: ClusterError,
    },

    #[error("failed waiting for namespace deletion: {0}")]
    Watch(#[source] WaitError),
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Delete the ClusterRoleBinding, the ClusterRole and the namespace.
    ///
    /// Objects that are already gone count as deleted, so this is safe to
    /// repeat. Returns once the namespace is observed deleted.
    pub async fn cleanup(&self, cancel: CancellationToken) -> Result<(), CleanupError> {
        let namespace = self.namespace().to_string();

        self.delete_if_present(ObjectRef::cluster(
            ObjectKind::ClusterRoleBinding,
            namespaced_name(CLUSTER_ROLE_BINDING_NAME, &namespace),
        ))
        .await?;

        self.delete_if_present(ObjectRef::cluster(
            ObjectKind::ClusterRole,
            namespaced_name(CLUSTER_ROLE_NAME, &namespace),
        ))
        .await?;

        // Watch first so a fast deletion cannot slip past us
        let resource = format!("namespace/{namespace}");
        let cluster = self.cluster.as_ref();
        let events = cluster
            .watch_namespaces(&namespace, None)
            .await
            .map_err(|e| CleanupError::Watch(super::readiness::watch_failed(&resource, e)))?;

        let target = ObjectRef::cluster(ObjectKind::Namespace, namespace.as_str());
        match self.cluster.delete(&target).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, "Namespace already deleted");
                return Ok(());
            }
            Err(source) => {
                return Err(CleanupError::Delete {
                    object: target,
                    source,
                })
            }
        }

        info!(namespace = %namespace, "Waiting for Namespace to be deleted");

        let waiter = Waiter::new(resource).ignore_failures().cancel_on(cancel);
        let waiter = match self.config.namespace_delete_timeout {
            Some(timeout) => waiter.timeout(timeout),
            None => waiter.no_timeout(),
        };

        match waiter
            .until(
                events,
                |version| cluster.watch_namespaces(&namespace, version),
                |kind, _| kind == EventKind::Deleted,
            )
            .await
            .map_err(CleanupError::Watch)?
        {
            Observed::Matched(_) => info!(namespace = %namespace, "Deleted Namespace"),
            Observed::Closed(_) => {
                warn!(namespace = %namespace, "Namespace watch closed before deletion was observed")
            }
        }

        Ok(())
    }

    async fn delete_if_present(&self, object: ObjectRef) -> Result<(), CleanupError> {
        match self.cluster.delete(&object).await {
            Ok(()) => {
                info!(kind = %object.kind, name = %object.name, "Deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %object.kind, name = %object.name, "Already deleted");
                Ok(())
            }
            Err(source) => Err(CleanupError::Delete { object, source }),
        }
    }
}

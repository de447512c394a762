use super::TestRunner;
use crate::cluster::{ClusterApi, ClusterError, ClusterObject, ObjectKind, ObjectRef};
use crate::config::ConfigMapConflict;
use crate::manifests;
use std::path::PathBuf;
use tracing::info;

/// Errors from creating the run's resources
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("{kind} {name} already exists, please run cleanup first")]
    PreflightConflict { kind: ObjectKind, name: String },

    #[error("failed to read repo list {path}: {source}")]
    RepoList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {kind} {name}: {source}")]
    Create {
        kind: ObjectKind,
        name: String,
        #[source]
        source: ClusterError,
    },
}

/// What deployment did with each object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub created: Vec<ObjectRef>,
    pub reused: Vec<ObjectRef>,
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Create the namespace, RBAC objects, optional repo-list ConfigMap and
    /// the workload pod, in that order.
    ///
    /// Existing objects abort the run unless `skip_preflight` is set. The
    /// first other error stops the sequence; objects created so far are left
    /// for cleanup.
    pub async fn deploy(&self, image: &str) -> Result<DeployReport, DeployError> {
        let repo_list = match &self.config.test_repo_list {
            Some(path) => Some(tokio::fs::read_to_string(path).await.map_err(|source| {
                DeployError::RepoList {
                    path: path.clone(),
                    source,
                }
            })?),
            None => None,
        };

        let rbac = manifests::rbac(&self.config);
        let mut objects = vec![
            ClusterObject::Namespace(manifests::namespace(&self.config)),
            ClusterObject::ServiceAccount(rbac.service_account),
            ClusterObject::ClusterRole(rbac.cluster_role),
            ClusterObject::ClusterRoleBinding(rbac.cluster_role_binding),
        ];

        let with_repo_list = repo_list.is_some();
        if let Some(contents) = repo_list {
            objects.push(ClusterObject::ConfigMap(manifests::repo_list_config_map(
                &self.config,
                contents,
            )));
        }

        objects.push(ClusterObject::Pod(manifests::conformance_pod(
            &self.config,
            image,
            with_repo_list,
        )));

        let mut report = DeployReport::default();
        for object in objects {
            self.create_object(object, &mut report).await?;
        }

        Ok(report)
    }

    fn may_reuse(&self, kind: ObjectKind) -> bool {
        if !self.config.skip_preflight {
            return false;
        }
        kind != ObjectKind::ConfigMap || self.config.config_map_conflict == ConfigMapConflict::Reuse
    }

    async fn create_object(
        &self,
        object: ClusterObject,
        report: &mut DeployReport,
    ) -> Result<(), DeployError> {
        let target = object.object_ref();

        match self.cluster.create(object).await {
            Ok(created) => {
                info!(kind = %created.kind, name = %created.name, "Created");
                report.created.push(created);
                Ok(())
            }
            Err(e) if e.is_already_exists() && self.may_reuse(target.kind) => {
                info!(kind = %target.kind, name = %target.name, "Using existing");
                report.reused.push(target);
                Ok(())
            }
            Err(e) if e.is_already_exists() => Err(DeployError::PreflightConflict {
                kind: target.kind,
                name: target.name,
            }),
            Err(source) => Err(DeployError::Create {
                kind: target.kind,
                name: target.name,
                source,
            }),
        }
    }
}

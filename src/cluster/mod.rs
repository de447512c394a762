//! Cluster resource access
//!
//! Everything the conformance run needs from the Kubernetes API goes through
//! the [`ClusterApi`] trait: typed create/delete, name-scoped watches, remote
//! exec and container log streams. [`KubeCluster`] is the real implementation;
//! tests drive the orchestration against an in-memory fake.
//!
//! A `ClusterApi` value is created once at process start and handed to the
//! [`TestRunner`](crate::runner::TestRunner). It is shared between the log
//! feeds behind an `Arc`, so implementations must allow concurrent calls.

mod client;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{resolve_kubeconfig, KubeCluster};

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::WatchEvent;
use std::fmt;

/// Stream of watch events for a single named object
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClusterError>>;

/// Stream of container log lines (without trailing newline)
pub type LineStream = BoxStream<'static, Result<String, ClusterError>>;

/// Errors from cluster operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("Kubernetes API error: {0}")]
    Api(String),

    #[error("Failed to watch {resource}: {message}")]
    Watch { resource: String, message: String },

    #[error("Failed to exec in pod {pod}: {message}")]
    Exec { pod: String, message: String },

    #[error("Failed to stream logs from pod {pod}: {message}")]
    Logs { pod: String, message: String },

    #[error("Failed to create Kubernetes client: {0}")]
    Client(String),
}

impl ClusterError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Kinds of objects the runner creates and deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Namespace,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Pod,
}

impl ObjectKind {
    /// Whether objects of this kind live outside any namespace
    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            Self::Namespace | Self::ClusterRole | Self::ClusterRoleBinding
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::ConfigMap => "ConfigMap",
            Self::Pod => "Pod",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object: kind, optional namespace, name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Reference to a cluster-scoped object
    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    /// Reference to a namespaced object
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A typed object to be created in the cluster
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    Pod(Pod),
}

impl ClusterObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Namespace(_) => ObjectKind::Namespace,
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::ClusterRole(_) => ObjectKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::Pod(_) => ObjectKind::Pod,
        }
    }

    fn metadata(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Self::Namespace(o) => &o.metadata,
            Self::ServiceAccount(o) => &o.metadata,
            Self::ClusterRole(o) => &o.metadata,
            Self::ClusterRoleBinding(o) => &o.metadata,
            Self::ConfigMap(o) => &o.metadata,
            Self::Pod(o) => &o.metadata,
        }
    }

    #[cfg(test)]
    fn metadata_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Self::Namespace(o) => &mut o.metadata,
            Self::ServiceAccount(o) => &mut o.metadata,
            Self::ClusterRole(o) => &mut o.metadata,
            Self::ClusterRoleBinding(o) => &mut o.metadata,
            Self::ConfigMap(o) => &mut o.metadata,
            Self::Pod(o) => &mut o.metadata,
        }
    }

    /// Fill in `metadata.name` from `generateName` and `suffix` when unnamed
    #[cfg(test)]
    pub(crate) fn assign_generated_name(&mut self, suffix: &str) {
        let meta = self.metadata_mut();
        if meta.name.is_none() {
            if let Some(prefix) = meta.generate_name.as_deref() {
                meta.name = Some(format!("{prefix}{suffix}"));
            }
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.kind().is_cluster_scoped() {
            return None;
        }
        self.metadata().namespace.as_deref()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: self.kind(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }
}

/// Output captured from a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Options for reading a container log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open and deliver new lines as they are written
    pub follow: bool,
    /// Only return the last N lines
    pub tail_lines: Option<i64>,
}

impl LogOptions {
    pub fn follow() -> Self {
        Self {
            follow: true,
            tail_lines: None,
        }
    }

    pub fn tail(lines: i64) -> Self {
        Self {
            follow: false,
            tail_lines: Some(lines),
        }
    }
}

/// Access to the Kubernetes API used by a conformance run
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create an object and return its reference, including a server
    /// generated name. An existing object yields [`ClusterError::AlreadyExists`]
    async fn create(&self, object: ClusterObject) -> Result<ObjectRef, ClusterError>;

    /// Delete an object; a missing object yields [`ClusterError::NotFound`]
    async fn delete(&self, object: &ObjectRef) -> Result<(), ClusterError>;

    /// Fetch the current state of a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    /// Watch a single pod by name.
    ///
    /// Without a `resource_version` the stream starts with the current state
    /// of the pod; with one it resumes after that version.
    async fn watch_pods(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, ClusterError>;

    /// Watch a single namespace by name, resuming like [`ClusterApi::watch_pods`]
    async fn watch_namespaces(
        &self,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Namespace>, ClusterError>;

    /// Run a command in a container and collect its output
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ClusterError>;

    /// Stream the log of a container line by line
    async fn log_lines(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: LogOptions,
    ) -> Result<LineStream, ClusterError>;

    /// Version string reported by the API server, e.g. `v1.31.2`
    async fn server_version(&self) -> Result<String, ClusterError>;
}

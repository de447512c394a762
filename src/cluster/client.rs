use super::{
    ClusterApi, ClusterError, ClusterObject, ExecOutput, LineStream, LogOptions, ObjectKind,
    ObjectRef, WatchStream,
};
use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, AttachParams, DeleteParams, LogParams, PostParams, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// [`ClusterApi`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig, or infer the configuration
    /// (in-cluster service account, `$KUBECONFIG`, `~/.kube/config`).
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Client(format!(
                        "failed to read kubeconfig {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Client(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Client(e.to_string()))?,
        };

        debug!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API");

        let client = Client::try_from(config).map_err(|e| ClusterError::Client(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Resolve the kubeconfig to use: the explicit path, else `$KUBECONFIG`.
///
/// A leading `~` is expanded to the home directory. `None` means the
/// configuration should be inferred.
pub fn resolve_kubeconfig(explicit: Option<&str>) -> Option<PathBuf> {
    resolve_kubeconfig_from(
        explicit,
        std::env::var("KUBECONFIG").ok(),
        std::env::var("HOME").ok(),
    )
}

fn resolve_kubeconfig_from(
    explicit: Option<&str>,
    env_kubeconfig: Option<String>,
    home: Option<String>,
) -> Option<PathBuf> {
    let raw = explicit
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .or_else(|| env_kubeconfig.filter(|p| !p.is_empty()))?;

    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = home {
            return Some(PathBuf::from(home).join(rest.trim_start_matches('/')));
        }
    }

    Some(PathBuf::from(raw))
}

/// Improve a kube error message with human-readable context
fn improve_error_message(err: &kube::Error, resource_kind: &str, resource_name: &str) -> String {
    let raw = err.to_string();

    if raw.contains("Forbidden") || raw.contains("403") {
        return format!("{resource_kind} '{resource_name}': permission denied (check RBAC)");
    }

    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{resource_kind} '{resource_name}': cannot connect to Kubernetes API");
    }

    if raw.contains("timeout") || raw.contains("deadline exceeded") {
        return format!("{resource_kind} '{resource_name}': operation timed out");
    }

    format!("{resource_kind} '{resource_name}': {raw}")
}

fn classify(err: &kube::Error, kind: ObjectKind, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        _ => ClusterError::Api(improve_error_message(err, kind.as_str(), name)),
    }
}

/// Create an object and return the name the API server stored it under
async fn create_with<K>(api: Api<K>, object: &K, kind: ObjectKind, name: &str) -> Result<String, ClusterError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    let created = api
        .create(&PostParams::default(), object)
        .await
        .map_err(|e| classify(&e, kind, name))?;

    Ok(created.meta().name.clone().unwrap_or_else(|| name.to_string()))
}

async fn delete_with<K>(api: Api<K>, kind: ObjectKind, name: &str) -> Result<(), ClusterError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.delete(name, &DeleteParams::default())
        .await
        .map(|_| ())
        .map_err(|e| classify(&e, kind, name))
}

/// The API server ends every watch after `timeoutSeconds`; callers resume
/// from the last version they saw
async fn watch_named<K>(
    api: Api<K>,
    name: &str,
    resource: String,
    resource_version: Option<String>,
) -> Result<WatchStream<K>, ClusterError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let params = WatchParams::default().fields(&format!("metadata.name={name}"));
    // "0" replays the current object as an Added event
    let version = resource_version.as_deref().unwrap_or("0");

    let stream = api
        .watch(&params, version)
        .await
        .map_err(|e| ClusterError::Watch {
            resource: resource.clone(),
            message: e.to_string(),
        })?;

    Ok(stream
        .map_err(move |e| ClusterError::Watch {
            resource: resource.clone(),
            message: e.to_string(),
        })
        .boxed())
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut output = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut output).await?;
    }
    Ok(output)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create(&self, object: ClusterObject) -> Result<ObjectRef, ClusterError> {
        let kind = object.kind();
        let name = object.name().to_string();
        let namespace = object.namespace().map(str::to_string);
        let ns = namespace.clone().unwrap_or_default();
        let client = self.client.clone();

        let created = match &object {
            ClusterObject::Namespace(ns) => {
                create_with(Api::<Namespace>::all(client), ns, kind, &name).await
            }
            ClusterObject::ClusterRole(role) => {
                create_with(Api::<ClusterRole>::all(client), role, kind, &name).await
            }
            ClusterObject::ClusterRoleBinding(binding) => {
                create_with(Api::<ClusterRoleBinding>::all(client), binding, kind, &name).await
            }
            ClusterObject::ServiceAccount(sa) => {
                create_with(Api::<ServiceAccount>::namespaced(client, &ns), sa, kind, &name).await
            }
            ClusterObject::ConfigMap(cm) => {
                create_with(Api::<ConfigMap>::namespaced(client, &ns), cm, kind, &name).await
            }
            ClusterObject::Pod(pod) => {
                create_with(Api::<Pod>::namespaced(client, &ns), pod, kind, &name).await
            }
        }?;

        Ok(ObjectRef {
            kind,
            namespace,
            name: created,
        })
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ClusterError> {
        let client = self.client.clone();
        let name = object.name.as_str();
        let namespace = || {
            object.namespace.clone().ok_or_else(|| {
                ClusterError::Api(format!("{object} cannot be deleted without a namespace"))
            })
        };

        match object.kind {
            ObjectKind::Namespace => delete_with(Api::<Namespace>::all(client), object.kind, name).await,
            ObjectKind::ClusterRole => {
                delete_with(Api::<ClusterRole>::all(client), object.kind, name).await
            }
            ObjectKind::ClusterRoleBinding => {
                delete_with(Api::<ClusterRoleBinding>::all(client), object.kind, name).await
            }
            ObjectKind::ServiceAccount => {
                let ns = namespace()?;
                delete_with(Api::<ServiceAccount>::namespaced(client, &ns), object.kind, name).await
            }
            ObjectKind::ConfigMap => {
                let ns = namespace()?;
                delete_with(Api::<ConfigMap>::namespaced(client, &ns), object.kind, name).await
            }
            ObjectKind::Pod => {
                let ns = namespace()?;
                delete_with(Api::<Pod>::namespaced(client, &ns), object.kind, name).await
            }
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.get(name)
            .await
            .map_err(|e| classify(&e, ObjectKind::Pod, name))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, ClusterError> {
        debug!(namespace = %namespace, pod = %name, resource_version = ?resource_version, "Starting watch for pod");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        watch_named(pods, name, format!("pod/{name}"), resource_version).await
    }

    async fn watch_namespaces(
        &self,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Namespace>, ClusterError> {
        debug!(namespace = %name, resource_version = ?resource_version, "Starting watch for namespace");

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        watch_named(namespaces, name, format!("namespace/{name}"), resource_version).await
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let exec_error = |message: String| ClusterError::Exec {
            pod: pod.to_string(),
            message,
        };

        let attach_params = AttachParams {
            container: Some(container.to_string()),
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        debug!(
            namespace = %namespace,
            pod = %pod,
            container = %container,
            command = ?command,
            "Executing command in pod"
        );

        let mut attached = pods
            .exec(pod, command, &attach_params)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let stdout = stdout.map_err(|e| exec_error(e.to_string()))?;
        let stderr = stderr.map_err(|e| exec_error(e.to_string()))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    let message = status.message.unwrap_or_default();
                    return Err(exec_error(format!("{message} (stderr: {})", stderr.trim())));
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        Ok(ExecOutput { stdout, stderr })
    }

    async fn log_lines(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: LogOptions,
    ) -> Result<LineStream, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let params = LogParams {
            container: Some(container.to_string()),
            follow: options.follow,
            tail_lines: options.tail_lines,
            ..Default::default()
        };

        debug!(
            namespace = %namespace,
            pod = %pod,
            container = %container,
            follow = options.follow,
            "Starting log stream"
        );

        let pod_name = pod.to_string();
        let reader = pods
            .log_stream(pod, &params)
            .await
            .map_err(|e| ClusterError::Logs {
                pod: pod_name.clone(),
                message: improve_error_message(&e, "Pod", pod),
            })?;

        Ok(reader
            .lines()
            .map_err(move |e| ClusterError::Logs {
                pod: pod_name.clone(),
                message: e.to_string(),
            })
            .boxed())
    }

    async fn server_version(&self) -> Result<String, ClusterError> {
        self.client
            .apiserver_version()
            .await
            .map(|info| info.git_version)
            .map_err(|e| ClusterError::Api(format!("failed fetching server version: {e}")))
    }
}

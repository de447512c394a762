//! Scripted in-memory cluster used by the orchestration tests

use super::{
    ClusterApi, ClusterError, ClusterObject, ExecOutput, LineStream, LogOptions, ObjectKind,
    ObjectRef, WatchStream,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Namespace, Pod, PodStatus,
};
use kube::api::{ObjectMeta, WatchEvent};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

struct WatchScript<K> {
    events: Vec<WatchEvent<K>>,
    hang: bool,
}

impl<K: Send + 'static> WatchScript<K> {
    fn into_stream(self) -> WatchStream<K> {
        let tail = if self.hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        stream::iter(self.events.into_iter().map(Ok))
            .chain(tail)
            .boxed()
    }
}

/// One scripted follow-mode log connection
pub(crate) enum LogScript {
    /// Deliver the lines, then end the stream (or stay open when `hang`)
    Lines { lines: Vec<String>, hang: bool },
    /// Deliver the lines, then fail mid-stream
    Broken { lines: Vec<String>, error: ClusterError },
    /// Fail to open the stream at all
    OpenFails(ClusterError),
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectRef, ClusterObject>>,
    created: Mutex<Vec<ObjectRef>>,
    deleted: Mutex<Vec<ObjectRef>>,
    create_failures: Mutex<HashMap<ObjectKind, ClusterError>>,
    pod_watches: Mutex<VecDeque<WatchScript<Pod>>>,
    namespace_watches: Mutex<VecDeque<WatchScript<Namespace>>>,
    follow_logs: Mutex<VecDeque<LogScript>>,
    tail_logs: Mutex<VecDeque<Vec<String>>>,
    exec_results: Mutex<VecDeque<Result<ExecOutput, ClusterError>>>,
    exec_commands: Mutex<Vec<(String, Vec<String>)>>,
    calls: Mutex<Vec<String>>,
    watch_versions: Mutex<Vec<Option<String>>>,
    log_opens: AtomicUsize,
    tail_reads: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Put an object into the cluster without recording a creation
    pub(crate) fn insert(&self, object: ClusterObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.object_ref(), object);
    }

    pub(crate) fn fail_create(&self, kind: ObjectKind, error: ClusterError) {
        self.create_failures.lock().unwrap().insert(kind, error);
    }

    pub(crate) fn push_pod_watch(&self, events: Vec<WatchEvent<Pod>>, hang: bool) {
        self.pod_watches
            .lock()
            .unwrap()
            .push_back(WatchScript { events, hang });
    }

    pub(crate) fn push_namespace_watch(&self, events: Vec<WatchEvent<Namespace>>, hang: bool) {
        self.namespace_watches
            .lock()
            .unwrap()
            .push_back(WatchScript { events, hang });
    }

    pub(crate) fn push_follow_log(&self, script: LogScript) {
        self.follow_logs.lock().unwrap().push_back(script);
    }

    pub(crate) fn push_tail_log(&self, lines: &[&str]) {
        self.tail_logs
            .lock()
            .unwrap()
            .push_back(lines.iter().map(|l| (*l).to_string()).collect());
    }

    pub(crate) fn push_exec(&self, result: Result<ExecOutput, ClusterError>) {
        self.exec_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn contains(&self, object: &ObjectRef) -> bool {
        self.objects.lock().unwrap().contains_key(object)
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub(crate) fn created(&self) -> Vec<ObjectRef> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<ObjectRef> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn object(&self, object: &ObjectRef) -> Option<ClusterObject> {
        self.objects.lock().unwrap().get(object).cloned()
    }

    pub(crate) fn exec_commands(&self) -> Vec<(String, Vec<String>)> {
        self.exec_commands.lock().unwrap().clone()
    }

    /// Creates, deletes and watches in the order they were issued
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Resource version passed to each watch, in call order
    pub(crate) fn watch_versions(&self) -> Vec<Option<String>> {
        self.watch_versions.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub(crate) fn log_opens(&self) -> usize {
        self.log_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn tail_reads(&self) -> usize {
        self.tail_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create(&self, mut object: ClusterObject) -> Result<ObjectRef, ClusterError> {
        let kind = object.kind();
        if let Some(err) = self.create_failures.lock().unwrap().get(&kind) {
            return Err(err.clone());
        }

        let suffix = format!("{:05}", self.created.lock().unwrap().len());
        object.assign_generated_name(&suffix);
        self.record(format!("create {}", object.object_ref()));

        let key = object.object_ref();
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind,
                name: key.name,
            });
        }
        objects.insert(key.clone(), object);
        self.created.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ClusterError> {
        self.record(format!("delete {object}"));
        let mut objects = self.objects.lock().unwrap();
        if objects.remove(object).is_none() {
            return Err(ClusterError::NotFound {
                kind: object.kind,
                name: object.name.clone(),
            });
        }

        if object.kind == ObjectKind::Namespace {
            objects.retain(|key, _| key.namespace.as_deref() != Some(object.name.as_str()));
        }
        self.deleted.lock().unwrap().push(object.clone());
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let key = ObjectRef::namespaced(ObjectKind::Pod, namespace, name);
        match self.objects.lock().unwrap().get(&key) {
            Some(ClusterObject::Pod(pod)) => Ok(pod.clone()),
            _ => Err(ClusterError::NotFound {
                kind: ObjectKind::Pod,
                name: name.to_string(),
            }),
        }
    }

    /// Each call consumes one scripted watch; once they run out the watch
    /// cannot be opened
    async fn watch_pods(
        &self,
        _namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Pod>, ClusterError> {
        let resource = format!("pod/{name}");
        self.record(format!("watch {resource}"));
        self.watch_versions.lock().unwrap().push(resource_version);
        let script = self.pod_watches.lock().unwrap().pop_front();
        script
            .map(WatchScript::into_stream)
            .ok_or_else(|| unscripted_watch(resource))
    }

    async fn watch_namespaces(
        &self,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<WatchStream<Namespace>, ClusterError> {
        let resource = format!("namespace/{name}");
        self.record(format!("watch {resource}"));
        self.watch_versions.lock().unwrap().push(resource_version);
        let script = self.namespace_watches.lock().unwrap().pop_front();
        script
            .map(WatchScript::into_stream)
            .ok_or_else(|| unscripted_watch(resource))
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, ClusterError> {
        self.exec_commands
            .lock()
            .unwrap()
            .push((container.to_string(), command));

        self.exec_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ClusterError::Exec {
                    pod: pod.to_string(),
                    message: "no scripted exec result".to_string(),
                })
            })
    }

    async fn log_lines(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        options: LogOptions,
    ) -> Result<LineStream, ClusterError> {
        if !options.follow {
            self.tail_reads.fetch_add(1, Ordering::SeqCst);
            let lines = self.tail_logs.lock().unwrap().pop_front().unwrap_or_default();
            return Ok(stream::iter(lines.into_iter().map(Ok)).boxed());
        }

        self.log_opens.fetch_add(1, Ordering::SeqCst);
        let script = self.follow_logs.lock().unwrap().pop_front();
        match script {
            Some(LogScript::Lines { lines, hang }) => {
                let tail = if hang {
                    stream::pending().boxed()
                } else {
                    stream::empty().boxed()
                };
                Ok(stream::iter(lines.into_iter().map(Ok)).chain(tail).boxed())
            }
            Some(LogScript::Broken { lines, error }) => Ok(stream::iter(lines.into_iter().map(Ok))
                .chain(stream::once(async move { Err(error) }))
                .boxed()),
            Some(LogScript::OpenFails(error)) => Err(error),
            None => Err(ClusterError::Logs {
                pod: pod.to_string(),
                message: "no scripted log stream".to_string(),
            }),
        }
    }

    async fn server_version(&self) -> Result<String, ClusterError> {
        Ok("v1.31.2".to_string())
    }
}

fn unscripted_watch(resource: String) -> ClusterError {
    ClusterError::Watch {
        resource,
        message: "no scripted watch".to_string(),
    }
}

/// Build a pod in the given phase with the given container states
pub(crate) fn pod(
    namespace: &str,
    name: &str,
    phase: &str,
    containers: Vec<(&str, ContainerState)>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: Some(
                containers
                    .into_iter()
                    .map(|(name, state)| ContainerStatus {
                        name: name.to_string(),
                        state: Some(state),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn waiting(reason: &str, message: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
        ..Default::default()
    }
}

pub(crate) fn running() -> ContainerState {
    ContainerState {
        running: Some(ContainerStateRunning::default()),
        ..Default::default()
    }
}

pub(crate) fn terminated(exit_code: i32, reason: &str) -> ContainerState {
    ContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code,
            reason: Some(reason.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Stamp an object with a resource version
pub(crate) fn versioned<K: kube::Resource>(mut object: K, version: &str) -> K {
    object.meta_mut().resource_version = Some(version.to_string());
    object
}

//! Watch-driven waiting with rich errors
//!
//! [`Waiter`] consumes a name-scoped watch until a predicate holds, the
//! object fails, the deadline passes or the caller cancels. Timeouts carry
//! the last observed state so the operator can see what was stuck.
//!
//! # Example
//!
//! ```ignore
//! let events = cluster.watch_pods("conformance", "e2e-conformance-test", None).await?;
//! let pod = Waiter::new("pod/e2e-conformance-test")
//!     .timeout(Duration::from_secs(300))
//!     .cancel_on(cancel.clone())
//!     .until(
//!         events,
//!         |version| cluster.watch_pods("conformance", "e2e-conformance-test", version),
//!         |_, pod| pod_phase(pod) != "Pending",
//!     )
//!     .await?;
//! ```

use crate::cluster::{ClusterError, WatchStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::WatchEvent;
use kube::Resource;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Container reasons that mean the workload will not recover on its own
pub const CONTAINER_FAILURE_REASONS: [&str; 4] =
    ["ErrImagePull", "ImagePullBackOff", "Error", "CrashLoopBackOff"];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause before reopening an ended watch
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Details of a wait that ran out of time
#[derive(Debug, Clone)]
pub struct WaitTimeout {
    /// Resource reference (e.g., "pod/e2e-conformance-test")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        write!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

/// Errors from [`Waiter::until`]
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("{0}")]
    Timeout(WaitTimeout),

    #[error("{resource} failed: {message}")]
    WorkloadFailed { resource: String, message: String },

    #[error("watch on {resource} failed: {message}")]
    Watch { resource: String, message: String },

    #[error("wait for {0} was cancelled")]
    Cancelled(String),
}

/// Kind of change a watch event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// How a successful wait ended
#[derive(Debug, Clone)]
pub enum Observed<K> {
    /// The predicate held for this object
    Matched(K),
    /// The watch closed first; carries the last object seen, if any
    Closed(Option<K>),
}

impl<K> Observed<K> {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    /// The matching object, or the last one observed before the watch closed
    pub fn into_object(self) -> Option<K> {
        match self {
            Self::Matched(object) => Some(object),
            Self::Closed(last) => last,
        }
    }
}

/// Helper trait for extracting state from watched resources
pub trait ResourceState {
    /// Get a human-readable description of the resource's current state
    fn state_description(&self) -> String;

    /// A message when the resource is in a state it will not recover from
    fn failure(&self) -> Option<String> {
        None
    }
}

/// Pod phase, `Unknown` when the status is missing
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

impl ResourceState for Pod {
    fn state_description(&self) -> String {
        let phase = pod_phase(self);
        let statuses = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());

        match statuses {
            Some(statuses) => {
                let total = statuses.len();
                let ready = statuses.iter().filter(|c| c.ready).count();

                let waiting_reasons: Vec<&str> = statuses
                    .iter()
                    .filter_map(|c| {
                        c.state
                            .as_ref()
                            .and_then(|s| s.waiting.as_ref())
                            .and_then(|w| w.reason.as_deref())
                    })
                    .collect();

                if waiting_reasons.is_empty() {
                    format!("phase={}, containers {}/{} ready", phase, ready, total)
                } else {
                    format!(
                        "phase={}, containers {}/{} ready, waiting: {}",
                        phase,
                        ready,
                        total,
                        waiting_reasons.join(", ")
                    )
                }
            }
            None => format!("phase={}, no container status", phase),
        }
    }

    fn failure(&self) -> Option<String> {
        let statuses = self.status.as_ref()?.container_statuses.as_ref()?;
        let is_failure = |reason: Option<&String>| {
            reason.is_some_and(|r| CONTAINER_FAILURE_REASONS.contains(&r.as_str()))
        };

        for state in statuses.iter().filter_map(|c| c.state.as_ref()) {
            if let Some(waiting) = state.waiting.as_ref() {
                if is_failure(waiting.reason.as_ref()) {
                    return Some(waiting.message.clone().unwrap_or_default());
                }
            }

            if let Some(terminated) = state.terminated.as_ref() {
                if is_failure(terminated.reason.as_ref()) {
                    return Some(
                        terminated
                            .message
                            .clone()
                            .filter(|m| !m.is_empty())
                            .unwrap_or_else(|| "Pod has encountered an error".to_string()),
                    );
                }
            }
        }

        None
    }
}

impl ResourceState for Namespace {
    fn state_description(&self) -> String {
        let phase = self
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        format!("phase={}", phase)
    }
}

/// Builder for a single watch-until-condition wait
#[derive(Debug, Clone)]
pub struct Waiter {
    resource: String,
    timeout: Option<Duration>,
    check_failures: bool,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            check_failures: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait until the condition holds, the watch ends or the wait is cancelled
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Do not abort on failed containers
    pub fn ignore_failures(mut self) -> Self {
        self.check_failures = false;
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Consume `events` until `predicate` returns true.
    ///
    /// The API server ends watches after a few minutes. When `events` ends
    /// the wait reopens it through `reopen`, passing the last resource version
    /// seen so nothing in between is missed. If the watch cannot be reopened,
    /// or the object is deleted without matching, the last observed object is
    /// handed back as [`Observed::Closed`].
    pub async fn until<K, O, Fut, F>(
        self,
        events: WatchStream<K>,
        mut reopen: O,
        mut predicate: F,
    ) -> Result<Observed<K>, WaitError>
    where
        K: ResourceState + Resource + Send,
        O: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = Result<WatchStream<K>, ClusterError>>,
        F: FnMut(EventKind, &K) -> bool,
    {
        let start = Instant::now();
        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut events = Some(events);
        let mut resume: Option<String> = None;
        let mut last: Option<K> = None;

        loop {
            if events.is_none() {
                let reopened = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(self.cancelled()),
                    _ = &mut deadline => return Err(self.timed_out(start, last.as_ref())),
                    reopened = async {
                        tokio::time::sleep(REOPEN_BACKOFF).await;
                        reopen(resume.clone()).await
                    } => reopened,
                };

                match reopened {
                    Ok(stream) => events = Some(stream),
                    Err(e) => {
                        tracing::warn!(resource = %self.resource, error = %e, "Could not reopen watch");
                        return Ok(Observed::Closed(last));
                    }
                }
            }

            let Some(stream) = events.as_mut() else {
                continue;
            };

            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = &mut deadline => return Err(self.timed_out(start, last.as_ref())),
                event = stream.next() => event,
            };

            let (kind, object) = match event {
                None => {
                    tracing::debug!(resource = %self.resource, resource_version = ?resume, "Watch ended, reopening");
                    events = None;
                    continue;
                }
                Some(Err(e)) => {
                    return Err(WaitError::Watch {
                        resource: self.resource.clone(),
                        message: e.to_string(),
                    });
                }
                Some(Ok(WatchEvent::Added(o))) => (EventKind::Added, o),
                Some(Ok(WatchEvent::Modified(o))) => (EventKind::Modified, o),
                Some(Ok(WatchEvent::Deleted(o))) => (EventKind::Deleted, o),
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    resume = Some(bookmark.metadata.resource_version);
                    continue;
                }
                // 410 Gone: the resume version was compacted away, start over
                Some(Ok(WatchEvent::Error(e))) if e.code == 410 => {
                    tracing::debug!(resource = %self.resource, "Watch history expired, restarting from current state");
                    resume = None;
                    events = None;
                    continue;
                }
                Some(Ok(WatchEvent::Error(e))) => {
                    return Err(WaitError::Watch {
                        resource: self.resource.clone(),
                        message: e.message,
                    });
                }
            };

            if let Some(version) = object.meta().resource_version.clone() {
                resume = Some(version);
            }

            if self.check_failures {
                if let Some(message) = object.failure() {
                    return Err(WaitError::WorkloadFailed {
                        resource: self.resource.clone(),
                        message,
                    });
                }
            }

            if predicate(kind, &object) {
                return Ok(Observed::Matched(object));
            }

            if kind == EventKind::Deleted {
                tracing::debug!(resource = %self.resource, "Deleted before condition was met");
                return Ok(Observed::Closed(Some(object)));
            }

            tracing::trace!(resource = %self.resource, state = %object.state_description(), "Still waiting");
            last = Some(object);
        }
    }

    fn cancelled(&self) -> WaitError {
        WaitError::Cancelled(self.resource.clone())
    }

    fn timed_out<K: ResourceState>(&self, start: Instant, last: Option<&K>) -> WaitError {
        WaitError::Timeout(WaitTimeout {
            resource: self.resource.clone(),
            last_state: last
                .map(ResourceState::state_description)
                .unwrap_or_else(|| "unknown".to_string()),
            elapsed: start.elapsed(),
            timeout: self.timeout.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake;
    use crate::cluster::ClusterError;
    use futures::future::{self, Ready};
    use futures::stream::{self, StreamExt};
    use kube::core::watch::{Bookmark, BookmarkMeta};
    use kube::core::TypeMeta;
    use std::collections::{BTreeMap, VecDeque};

    fn script(events: Vec<WatchEvent<Pod>>, hang: bool) -> WatchStream<Pod> {
        let tail = if hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        stream::iter(events.into_iter().map(Ok)).chain(tail).boxed()
    }

    fn no_reopen(_: Option<String>) -> Ready<Result<WatchStream<Pod>, ClusterError>> {
        future::ready(Err(ClusterError::Watch {
            resource: "pod/p".to_string(),
            message: "connection refused".to_string(),
        }))
    }

    fn not_pending(_: EventKind, pod: &Pod) -> bool {
        pod_phase(pod) != "Pending"
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_matching_object() {
        let events = script(
            vec![
                WatchEvent::Added(fake::pod("ns", "p", "Pending", vec![])),
                WatchEvent::Modified(fake::pod("ns", "p", "Running", vec![("c", fake::running())])),
            ],
            true,
        );

        let observed = Waiter::new("pod/p").until(events, no_reopen, not_pending).await.unwrap();

        assert!(observed.is_matched());
        let pod = observed.into_object().unwrap();
        assert_eq!(pod_phase(&pod), "Running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_pull_backoff_fails_before_deadline() {
        let events = script(
            vec![WatchEvent::Modified(fake::pod(
                "ns",
                "p",
                "Pending",
                vec![("c", fake::waiting("ImagePullBackOff", "Back-off pulling image \"nope\""))],
            ))],
            true,
        );

        let result = Waiter::new("pod/p")
            .timeout(Duration::from_secs(365 * 24 * 3600))
            .until(events, no_reopen, not_pending)
            .await;

        match result {
            Err(WaitError::WorkloadFailed { message, .. }) => {
                assert_eq!(message, "Back-off pulling image \"nope\"");
            }
            other => panic!("Expected workload failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_error_without_message() {
        let events = script(
            vec![WatchEvent::Modified(fake::pod(
                "ns",
                "p",
                "Running",
                vec![("c", fake::terminated(1, "Error"))],
            ))],
            false,
        );

        let err = Waiter::new("pod/p")
            .until(events, no_reopen, not_pending)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Pod has encountered an error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_phase() {
        let events = script(
            vec![WatchEvent::Added(fake::pod(
                "ns",
                "p",
                "Pending",
                vec![("c", fake::waiting("ContainerCreating", ""))],
            ))],
            true,
        );

        let err = Waiter::new("pod/p")
            .timeout(Duration::from_secs(60))
            .until(events, no_reopen, not_pending)
            .await
            .unwrap_err();

        match err {
            WaitError::Timeout(timeout) => {
                assert!(timeout.last_state.contains("phase=Pending"));
                assert!(timeout.last_state.contains("ContainerCreating"));
                assert_eq!(timeout.timeout, Duration::from_secs(60));
                assert!(timeout.to_string().contains("Wait timeout for pod/p"));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_watch_returns_last_known() {
        let events = script(
            vec![WatchEvent::Added(fake::pod("ns", "p", "Pending", vec![]))],
            false,
        );

        let observed = Waiter::new("pod/p").until(events, no_reopen, not_pending).await.unwrap();
        assert!(!observed.is_matched());
        let pod = observed.into_object().unwrap();
        assert_eq!(pod_phase(&pod), "Pending");

        let empty = Waiter::new("pod/p")
            .until(script(vec![], false), no_reopen, not_pending)
            .await
            .unwrap();
        assert!(matches!(empty, Observed::Closed(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_failures_keeps_waiting() {
        let events = script(
            vec![
                WatchEvent::Modified(fake::pod("ns", "p", "Running", vec![("c", fake::terminated(2, "Error"))])),
                WatchEvent::Modified(fake::pod("ns", "p", "Failed", vec![("c", fake::terminated(2, "Error"))])),
            ],
            true,
        );

        let observed = Waiter::new("pod/p")
            .ignore_failures()
            .until(events, no_reopen, |_, pod| pod_phase(pod) == "Failed")
            .await
            .unwrap();

        assert!(observed.is_matched());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_wait() {
        let token = CancellationToken::new();
        token.cancel();

        let err = Waiter::new("pod/p")
            .no_timeout()
            .cancel_on(token)
            .until(script(vec![], true), no_reopen, not_pending)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_is_watch_failure() {
        let events: WatchStream<Pod> = stream::iter(vec![Err(ClusterError::Api(
            "connection reset".to_string(),
        ))])
        .boxed();

        let err = Waiter::new("pod/p")
            .until(events, no_reopen, not_pending)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Watch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_watch_resumes_from_last_version() {
        let events = script(
            vec![WatchEvent::Added(fake::versioned(fake::pod("ns", "p", "Pending", vec![]), "41"))],
            false,
        );
        let mut reopened = VecDeque::from([script(
            vec![WatchEvent::Modified(fake::pod("ns", "p", "Running", vec![("c", fake::running())]))],
            true,
        )]);
        let mut versions = Vec::new();

        let observed = Waiter::new("pod/p")
            .until(
                events,
                |version| {
                    versions.push(version);
                    future::ready(reopened.pop_front().ok_or(ClusterError::Api("exhausted".to_string())))
                },
                not_pending,
            )
            .await
            .unwrap();

        assert!(observed.is_matched());
        assert_eq!(versions, vec![Some("41".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_across_expiring_watches() {
        let events = script(
            vec![WatchEvent::Added(fake::pod("ns", "p", "Pending", vec![]))],
            false,
        );
        let mut opens = 0;

        let err = Waiter::new("pod/p")
            .timeout(Duration::from_secs(300))
            .until(
                events,
                |_| {
                    opens += 1;
                    future::ready(Ok(script(vec![], false)))
                },
                not_pending,
            )
            .await
            .unwrap_err();

        match err {
            WaitError::Timeout(timeout) => {
                assert!(timeout.last_state.contains("phase=Pending"));
                assert_eq!(timeout.timeout, Duration::from_secs(300));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(opens > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bookmark_and_gone_adjust_resume_version() {
        let gone = kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        };
        let bookmark = WatchEvent::Bookmark(Bookmark {
            types: TypeMeta {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
            },
            metadata: BookmarkMeta {
                resource_version: "77".to_string(),
                annotations: BTreeMap::new(),
            },
        });
        let events = script(vec![bookmark], false);
        let mut reopened = VecDeque::from([
            script(vec![WatchEvent::Error(gone)], true),
            script(
                vec![WatchEvent::Added(fake::pod("ns", "p", "Running", vec![("c", fake::running())]))],
                true,
            ),
        ]);
        let mut versions = Vec::new();

        let observed = Waiter::new("pod/p")
            .until(
                events,
                |version| {
                    versions.push(version);
                    future::ready(reopened.pop_front().ok_or(ClusterError::Api("exhausted".to_string())))
                },
                not_pending,
            )
            .await
            .unwrap();

        assert!(observed.is_matched());
        assert_eq!(versions, vec![Some("77".to_string()), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_object_ends_wait() {
        let events = script(
            vec![
                WatchEvent::Added(fake::pod("ns", "p", "Pending", vec![])),
                WatchEvent::Deleted(fake::pod("ns", "p", "Pending", vec![])),
            ],
            true,
        );

        let observed = Waiter::new("pod/p")
            .no_timeout()
            .until(events, no_reopen, not_pending)
            .await
            .unwrap();

        assert!(matches!(observed, Observed::Closed(Some(_))));
    }

    #[test]
    fn test_namespace_state_description() {
        let ns = fake::namespace("conformance");
        assert_eq!(ns.state_description(), "phase=Unknown");
        assert!(ns.failure().is_none());
    }
}

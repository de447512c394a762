//! Live test output
//!
//! The coordinator runs up to two feeds that share one bounded channel:
//!
//! - the primary feed follows the test container log and forwards each line.
//!   When the stream ends it asks the completion detector whether the suite
//!   really finished, and reconnects when it did not. Follow mode replays the
//!   log from the start, so lines already forwarded are skipped and a line
//!   that grew since it was forwarded only sends what was appended.
//! - the optional progress feed periodically reads the result log and turns
//!   it into [`ProgressSnapshot`]s.
//!
//! Progress messages are advisory. Only the primary feed sends `Done`.

use super::exit_code::test_container_exit_code;
use super::{RunError, TestRunner};
use crate::cluster::{ClusterApi, ClusterError, LogOptions};
use crate::config::RunConfig;
use crate::manifests::{result_path, CONFORMANCE_CONTAINER, E2E_LOG_FILE, POD_NAME};
use crate::progress::{ProgressError, ProgressMarkers, ProgressSnapshot};
use futures::{StreamExt, TryStreamExt};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Errors reported on the message channel
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("log stream could not be reopened after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    #[error("could not parse test progress: {0}")]
    Progress(String),
}

impl StreamError {
    /// Whether the run has to stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Unit exchanged on the coordinator's output channel
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Line(String),
    Progress(ProgressSnapshot),
    Error(StreamError),
    Done,
}

/// Tuning for the log stream coordinator
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Interval of the progress feed; `None` disables it
    pub progress_interval: Option<Duration>,
    /// Tail reads before deciding the stream merely dropped
    pub completion_attempts: u32,
    pub completion_backoff: Duration,
    /// Lines read from the end of the log when looking for the finish marker
    pub tail_lines: i64,
    /// Consecutive failures to open the stream before giving up
    pub max_reconnect_failures: u32,
    pub reconnect_backoff: Duration,
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for StreamSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            progress_interval: (!config.disable_progress_status)
                .then_some(config.progress_status_interval),
            completion_attempts: config.completion_check_attempts.max(1),
            completion_backoff: config.completion_check_backoff,
            tail_lines: 30,
            max_reconnect_failures: config.max_reconnect_failures,
            reconnect_backoff: config.reconnect_backoff,
            channel_capacity: 256,
        }
    }
}

enum Completion {
    Finished,
    StillRunning,
    Cancelled,
}

/// Where the primary feed stands in the log across reconnects.
///
/// Replayed lines before the last forwarded one are held back. The last
/// forwarded line may have been cut off when the stream ended, so a replay
/// that extends it forwards just the appended text. A replay that no longer
/// matches means the log was replaced, and what was held back goes out.
#[derive(Debug, Default)]
struct ReplayCursor {
    forwarded: usize,
    last: Option<String>,
    seen: usize,
    held: Vec<String>,
}

impl ReplayCursor {
    fn reconnect(&mut self) {
        self.seen = 0;
        self.held.clear();
    }

    /// Lines to forward for the next line read
    fn push(&mut self, line: String) -> Vec<String> {
        self.seen += 1;
        match self.seen.cmp(&self.forwarded) {
            Ordering::Less => {
                self.held.push(line);
                Vec::new()
            }
            Ordering::Greater => {
                self.forwarded = self.seen;
                self.last = Some(line.clone());
                vec![line]
            }
            Ordering::Equal => {
                let last = self.last.take().unwrap_or_default();
                if line == last {
                    self.held.clear();
                    self.last = Some(last);
                    Vec::new()
                } else if line.starts_with(&last) {
                    let appended = line[last.len()..].to_string();
                    self.held.clear();
                    self.last = Some(line);
                    vec![appended]
                } else {
                    warn!(line = self.seen, "Log changed since it was forwarded, forwarding it again");
                    self.held.push(line);
                    self.rewind()
                }
            }
        }
    }

    /// Lines to forward once the stream ended; `clean` is false when it broke
    fn finish(&mut self, clean: bool) -> Vec<String> {
        // An empty replay says nothing about the log
        if clean && self.seen > 0 && self.seen < self.forwarded {
            warn!(
                lines = self.seen,
                forwarded = self.forwarded,
                "Log is shorter than what was forwarded, forwarding it again"
            );
            return self.rewind();
        }
        self.held.clear();
        Vec::new()
    }

    fn rewind(&mut self) -> Vec<String> {
        let lines = std::mem::take(&mut self.held);
        self.forwarded = self.seen;
        self.last = lines.last().cloned();
        lines
    }
}

/// Receiving end of a started coordinator.
///
/// Dropping it stops every feed.
pub struct LogStream {
    messages: mpsc::Receiver<StreamMessage>,
    _feeds: DropGuard,
}

impl LogStream {
    /// Next message; `None` once all feeds have stopped
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.messages.recv().await
    }
}

/// Supervises the log feeds of one workload
pub struct LogStreamCoordinator<C> {
    cluster: Arc<C>,
    namespace: String,
    pod: String,
    settings: StreamSettings,
    markers: ProgressMarkers,
}

async fn send(tx: &mpsc::Sender<StreamMessage>, cancel: &CancellationToken, message: StreamMessage) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl<C: ClusterApi + 'static> LogStreamCoordinator<C> {
    pub fn new(
        cluster: Arc<C>,
        namespace: impl Into<String>,
        settings: StreamSettings,
    ) -> Result<Self, ProgressError> {
        Ok(Self {
            cluster,
            namespace: namespace.into(),
            pod: POD_NAME.to_string(),
            settings,
            markers: ProgressMarkers::new()?,
        })
    }

    /// Spawn the feeds and return the merged message stream.
    ///
    /// Cancelling `cancel` stops all feeds; the stream then ends without `Done`.
    pub fn start(self, cancel: CancellationToken) -> LogStream {
        let (tx, messages) = mpsc::channel(self.settings.channel_capacity);
        let feeds = cancel.child_token();
        let this = Arc::new(self);

        if let Some(interval) = this.settings.progress_interval {
            tokio::spawn(Arc::clone(&this).progress_feed(interval, tx.clone(), feeds.clone()));
        }

        let primary_feeds = feeds.clone();
        tokio::spawn(async move {
            this.primary_feed(&tx, &primary_feeds).await;
            // Progress is meaningless once the primary feed is over
            primary_feeds.cancel();
        });

        LogStream {
            messages,
            _feeds: feeds.drop_guard(),
        }
    }

    async fn primary_feed(&self, tx: &mpsc::Sender<StreamMessage>, cancel: &CancellationToken) {
        let mut cursor = ReplayCursor::default();
        let mut open_failures = 0u32;

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.cluster.log_lines(
                    &self.namespace,
                    &self.pod,
                    CONFORMANCE_CONTAINER,
                    LogOptions::follow(),
                ) => opened,
            };

            let mut lines = match opened {
                Ok(lines) => {
                    open_failures = 0;
                    lines
                }
                Err(e) => {
                    open_failures += 1;
                    if open_failures > self.settings.max_reconnect_failures {
                        error!(pod = %self.pod, attempts = open_failures, error = %e, "Giving up on log stream");
                        let failure = StreamError::Transport {
                            attempts: open_failures,
                            source: e,
                        };
                        send(tx, cancel, StreamMessage::Error(failure)).await;
                        return;
                    }

                    warn!(pod = %self.pod, attempt = open_failures, error = %e, "Failed to open log stream, retrying");
                    if !sleep_or_cancel(self.settings.reconnect_backoff, cancel).await {
                        return;
                    }
                    continue;
                }
            };

            cursor.reconnect();
            let pending = loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = lines.next() => next,
                };

                match next {
                    Some(Ok(line)) => {
                        for line in cursor.push(line) {
                            if !send(tx, cancel, StreamMessage::Line(line)).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(pod = %self.pod, error = %e, "Log stream broke");
                        break cursor.finish(false);
                    }
                    None => {
                        debug!(pod = %self.pod, lines = cursor.seen, "Log stream ended");
                        break cursor.finish(true);
                    }
                }
            };
            drop(lines);

            for line in pending {
                if !send(tx, cancel, StreamMessage::Line(line)).await {
                    return;
                }
            }

            match self.detect_completion(cancel).await {
                Completion::Finished => {
                    send(tx, cancel, StreamMessage::Done).await;
                    return;
                }
                Completion::StillRunning => {
                    info!(pod = %self.pod, "Tests are still running, reconnecting to log stream");
                }
                Completion::Cancelled => return,
            }
        }
    }

    /// Decide whether the suite finished after the log stream ended
    async fn detect_completion(&self, cancel: &CancellationToken) -> Completion {
        match self.cluster.get_pod(&self.namespace, &self.pod).await {
            Ok(pod) => {
                if let Some(code) = test_container_exit_code(&pod) {
                    debug!(pod = %self.pod, exit_code = code, "Test container terminated");
                    return Completion::Finished;
                }
            }
            Err(e) => debug!(pod = %self.pod, error = %e, "Could not read pod status"),
        }

        let attempts = self.settings.completion_attempts;
        for attempt in 1..=attempts {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Completion::Cancelled,
                read = self.tail_has_finish_marker() => read,
            };

            match read {
                Ok(true) => return Completion::Finished,
                Ok(false) => debug!(attempt, "No completion marker in log tail"),
                Err(e) => debug!(attempt, error = %e, "Failed to read log tail"),
            }

            if attempt < attempts && !sleep_or_cancel(self.settings.completion_backoff, cancel).await {
                return Completion::Cancelled;
            }
        }

        Completion::StillRunning
    }

    async fn tail_has_finish_marker(&self) -> Result<bool, ClusterError> {
        let lines: Vec<String> = self
            .cluster
            .log_lines(
                &self.namespace,
                &self.pod,
                CONFORMANCE_CONTAINER,
                LogOptions::tail(self.settings.tail_lines),
            )
            .await?
            .try_collect()
            .await?;

        Ok(lines.iter().any(|line| self.markers.is_suite_finished(line)))
    }

    async fn progress_feed(
        self: Arc<Self>,
        interval: Duration,
        tx: mpsc::Sender<StreamMessage>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate; the suite has not written anything yet
        ticker.tick().await;

        let command = vec!["cat".to_string(), result_path(E2E_LOG_FILE)];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let output = tokio::select! {
                _ = cancel.cancelled() => return,
                output = self.cluster.exec(
                    &self.namespace,
                    &self.pod,
                    CONFORMANCE_CONTAINER,
                    command.clone(),
                ) => output,
            };

            let log = match output {
                Ok(output) => output.stdout,
                Err(e) => {
                    debug!(pod = %self.pod, error = %e, "Progress check failed, retrying next interval");
                    continue;
                }
            };

            match self.markers.parse(&log) {
                Ok((total, completed)) => {
                    let snapshot = ProgressSnapshot::new(total, completed);
                    if !send(&tx, &cancel, StreamMessage::Progress(snapshot)).await {
                        return;
                    }
                    if snapshot.is_finished() {
                        debug!(total, "All tests completed, stopping progress updates");
                        return;
                    }
                }
                Err(ProgressError::SpecCountNotFound) => {
                    debug!("Test spec count not announced yet");
                }
                Err(e) => {
                    let message = StreamMessage::Error(StreamError::Progress(e.to_string()));
                    if !send(&tx, &cancel, message).await {
                        return;
                    }
                }
            }
        }
    }
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Write the test container's log to `out` until the suite finishes
    pub async fn stream_logs<W>(&self, out: &mut W, cancel: CancellationToken) -> Result<(), RunError>
    where
        W: AsyncWrite + Unpin,
    {
        let coordinator = LogStreamCoordinator::new(
            Arc::clone(&self.cluster),
            self.namespace(),
            StreamSettings::from(&self.config),
        )?;
        let mut stream = coordinator.start(cancel.clone());

        while let Some(message) = stream.recv().await {
            match message {
                StreamMessage::Line(line) => {
                    out.write_all(line.as_bytes()).await?;
                    out.write_all(b"\n").await?;
                    out.flush().await?;
                }
                StreamMessage::Progress(snapshot) => {
                    info!(completed = snapshot.completed, total = snapshot.total, "{snapshot}");
                }
                StreamMessage::Error(e) if e.is_fatal() => return Err(e.into()),
                StreamMessage::Error(e) => warn!(error = %e, "Progress update failed"),
                StreamMessage::Done => return Ok(()),
            }
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }
}

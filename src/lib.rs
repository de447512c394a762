//! Conformance Runner - run the Kubernetes conformance suite in a cluster
//!
//! Deploys the conformance image as a two-container pod, streams its log
//! back while reporting progress, copies the result files out, and removes
//! everything it created again.
//!
//! # Example
//!
//! ```no_run
//! use conformance_runner::{KubeCluster, RunConfig, TestRunner};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Arc::new(KubeCluster::connect(None).await?);
//!     let config = RunConfig::new().parallel(4).output_dir("results");
//!
//!     let runner = TestRunner::new(cluster, config);
//!     let status = runner.run(&mut tokio::io::stdout(), CancellationToken::new()).await?;
//!
//!     println!("Conformance exit status: {status}");
//!     Ok(())
//! }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Full run against the current kubeconfig context
//! conformance-runner --parallel 4 --output-dir results
//!
//! # Remove what an interrupted run left behind
//! conformance-runner --cleanup
//!
//! # Images the suite would pull
//! conformance-runner --list-images
//! ```

pub mod cluster;
pub mod config;
pub mod manifests;
pub mod progress;
pub mod runner;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use cluster::{ClusterApi, ClusterError, KubeCluster};
pub use config::{ConfigError, ConfigMapConflict, RunConfig};
pub use progress::{parse_progress, ProgressError, ProgressSnapshot};
pub use runner::{ExitStatus, RunError, StreamMessage, TestRunner};
pub use telemetry::init_logging;
pub use wait::{WaitError, WaitTimeout, Waiter};

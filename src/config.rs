//! Configuration for a conformance run
//!
//! Build it programmatically - the binary maps its flags onto this builder.
//!
//! # Example
//!
//! ```
//! use conformance_runner::config::RunConfig;
//! use std::time::Duration;
//!
//! let config = RunConfig::new()
//!     .namespace("conformance-ci")
//!     .parallel(4)
//!     .skip("\\[Serial\\]")
//!     .startup_timeout(Duration::from_secs(600))
//!     .skip_preflight(true);
//!
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Image used by the output container to hold the results volume open
pub const DEFAULT_BUSYBOX_IMAGE: &str = "registry.k8s.io/e2e-test-images/busybox:1.36.1-1";

/// Namespace the conformance pod is created in
pub const DEFAULT_NAMESPACE: &str = "conformance";

/// Ginkgo focus used when none is given
pub const DEFAULT_FOCUS: &str = "\\[Conformance\\]";

/// Errors from configuration validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid --extra-args: expected [{0}] to be of --key=value format")]
    InvalidExtraArg(String),

    #[error("invalid --extra-ginkgo-args: expected [{0}] to be of --key=value format")]
    InvalidGinkgoArg(String),

    #[error("--nodes/--procs is automatically set when --parallel is greater than 1")]
    ConflictingParallelism,

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("failed parsing server version {version}: {reason}")]
    InvalidServerVersion { version: String, reason: String },
}

/// What to do when the repo-list ConfigMap already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigMapConflict {
    /// Abort the run and ask the operator to clean up first
    #[default]
    Abort,
    /// Keep the existing ConfigMap when existing resources are reused
    Reuse,
}

/// Full configuration of one conformance run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Namespace for the workload and the suffix for cluster-scoped names
    pub namespace: String,

    /// Number of parallel ginkgo processes
    pub parallel: u32,

    /// Test framework verbosity; 6 and above turns on verbose ginkgo output
    pub verbosity: u32,

    /// Directory the log and junit artifacts are written to
    pub output_dir: PathBuf,

    /// Ginkgo focus regex
    pub focus: String,

    /// Ginkgo skip regex
    pub skip: String,

    /// Conformance image; derived from the server version when unset
    pub conformance_image: Option<String>,

    /// Image for the output container
    pub busybox_image: String,

    /// Ask the suite to only list what it would run
    pub dry_run: bool,

    /// Local YAML file overriding test image registries
    pub test_repo_list: Option<PathBuf>,

    /// Registry override passed to the suite
    pub test_repo: Option<String>,

    /// Extra `--key=value` arguments for the e2e binary
    pub extra_args: Vec<String>,

    /// Extra `--key=value` arguments for ginkgo
    pub extra_ginkgo_args: Vec<String>,

    /// How long the pod may take to leave `Pending`
    pub startup_timeout: Duration,

    /// Reuse resources left by an earlier run instead of aborting
    pub skip_preflight: bool,

    /// Policy for an already existing repo-list ConfigMap
    pub config_map_conflict: ConfigMapConflict,

    /// Turn off the periodic progress snapshot
    pub disable_progress_status: bool,

    /// Interval between progress snapshots
    pub progress_status_interval: Duration,

    /// Number of tail reads before deciding the log stream merely dropped
    pub completion_check_attempts: u32,

    /// Pause between tail reads
    pub completion_check_backoff: Duration,

    /// Consecutive failures to reopen the log stream before giving up
    pub max_reconnect_failures: u32,

    /// Pause before reopening a log stream that failed to open
    pub reconnect_backoff: Duration,

    /// Upper bound on waiting for the namespace to disappear
    pub namespace_delete_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            parallel: 1,
            verbosity: 4,
            output_dir: PathBuf::from("."),
            focus: DEFAULT_FOCUS.to_string(),
            skip: String::new(),
            conformance_image: None,
            busybox_image: DEFAULT_BUSYBOX_IMAGE.to_string(),
            dry_run: false,
            test_repo_list: None,
            test_repo: None,
            extra_args: Vec::new(),
            extra_ginkgo_args: Vec::new(),
            startup_timeout: Duration::from_secs(5 * 60),
            skip_preflight: false,
            config_map_conflict: ConfigMapConflict::Abort,
            disable_progress_status: false,
            progress_status_interval: Duration::from_secs(30),
            completion_check_attempts: 6,
            completion_check_backoff: Duration::from_secs(10),
            max_reconnect_failures: 5,
            reconnect_backoff: Duration::from_secs(5),
            namespace_delete_timeout: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn parallel(mut self, parallel: u32) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn verbosity(mut self, verbosity: u32) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the focus regex; an empty focus keeps the conformance default
    pub fn focus(mut self, focus: impl Into<String>) -> Self {
        let focus = focus.into();
        if !focus.is_empty() {
            self.focus = focus;
        }
        self
    }

    pub fn skip(mut self, skip: impl Into<String>) -> Self {
        self.skip = skip.into();
        self
    }

    pub fn conformance_image(mut self, image: impl Into<String>) -> Self {
        self.conformance_image = Some(image.into());
        self
    }

    pub fn busybox_image(mut self, image: impl Into<String>) -> Self {
        self.busybox_image = image.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn test_repo_list(mut self, path: impl Into<PathBuf>) -> Self {
        self.test_repo_list = Some(path.into());
        self
    }

    pub fn test_repo(mut self, repo: impl Into<String>) -> Self {
        self.test_repo = Some(repo.into());
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn extra_ginkgo_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_ginkgo_args
            .extend(args.into_iter().map(Into::into));
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn skip_preflight(mut self, skip: bool) -> Self {
        self.skip_preflight = skip;
        self
    }

    pub fn config_map_conflict(mut self, policy: ConfigMapConflict) -> Self {
        self.config_map_conflict = policy;
        self
    }

    pub fn disable_progress_status(mut self, disable: bool) -> Self {
        self.disable_progress_status = disable;
        self
    }

    pub fn progress_status_interval(mut self, interval: Duration) -> Self {
        self.progress_status_interval = interval;
        self
    }

    /// Tune the end-of-run detection used when the log stream ends
    pub fn completion_check(mut self, attempts: u32, backoff: Duration) -> Self {
        self.completion_check_attempts = attempts;
        self.completion_check_backoff = backoff;
        self
    }

    pub fn reconnect(mut self, max_failures: u32, backoff: Duration) -> Self {
        self.max_reconnect_failures = max_failures;
        self.reconnect_backoff = backoff;
        self
    }

    pub fn namespace_delete_timeout(mut self, timeout: Duration) -> Self {
        self.namespace_delete_timeout = Some(timeout);
        self
    }

    /// Whether ginkgo should print every spec as it runs
    pub fn verbose_ginkgo(&self) -> bool {
        self.verbosity >= 6
    }

    /// Ginkgo arguments including the derived `--procs` and `-v`
    pub fn ginkgo_args(&self) -> Vec<String> {
        let mut args = self.extra_ginkgo_args.clone();
        if self.parallel > 1 {
            args.push(format!("--procs={}", self.parallel));
        }
        if self.verbose_ginkgo() {
            args.push("-v".to_string());
        }
        args
    }

    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        if let Some(arg) = self.extra_args.iter().find(|a| !is_key_value_arg(a)) {
            return Err(ConfigError::InvalidExtraArg(arg.clone()));
        }

        if let Some(arg) = self.extra_ginkgo_args.iter().find(|a| !is_key_value_arg(a)) {
            return Err(ConfigError::InvalidGinkgoArg(arg.clone()));
        }

        if self.parallel > 1
            && self
                .extra_ginkgo_args
                .iter()
                .any(|a| a.contains("--nodes=") || a.contains("--procs="))
        {
            return Err(ConfigError::ConflictingParallelism);
        }

        Ok(())
    }
}

fn is_key_value_arg(arg: &str) -> bool {
    match arg.split_once('=') {
        Some((key, _)) => key.starts_with("--") && key.len() > 2,
        None => false,
    }
}

/// Conformance image matching the API server version, e.g.
/// `v1.31.2+k3s1` becomes `registry.k8s.io/conformance:v1.31.2`
pub fn default_conformance_image(server_version: &str) -> Result<String, ConfigError> {
    let trimmed = server_version.trim().trim_start_matches('v');
    let version = semver::Version::parse(trimmed).map_err(|e| ConfigError::InvalidServerVersion {
        version: server_version.to_string(),
        reason: e.to_string(),
    })?;

    Ok(format!(
        "registry.k8s.io/conformance:v{}.{}.{}",
        version.major, version.minor, version.patch
    ))
}

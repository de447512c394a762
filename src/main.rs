use clap::Parser;
use conformance_runner::cluster::{resolve_kubeconfig, KubeCluster};
use conformance_runner::config::{
    ConfigMapConflict, RunConfig, DEFAULT_BUSYBOX_IMAGE, DEFAULT_FOCUS, DEFAULT_NAMESPACE,
};
use conformance_runner::runner::{RunError, TestRunner};
use conformance_runner::telemetry;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the Kubernetes conformance suite in a cluster and stream its output
#[derive(Parser, Debug)]
#[command(name = "conformance-runner", version)]
struct Cli {
    /// Path to the kubeconfig (defaults to $KUBECONFIG, then in-cluster or ~/.kube/config)
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Namespace the workload runs in
    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Number of parallel ginkgo processes
    #[arg(short, long, default_value_t = 1)]
    parallel: u32,

    /// e2e verbosity; 6 and above also makes ginkgo verbose
    #[arg(short, long, default_value_t = 4)]
    verbosity: u32,

    /// Directory the result files are written to
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Regex selecting the tests to run
    #[arg(long, default_value = DEFAULT_FOCUS)]
    focus: String,

    /// Regex selecting the tests to skip
    #[arg(long, default_value = "")]
    skip: String,

    /// Conformance image (defaults to the one matching the API server version)
    #[arg(long)]
    conformance_image: Option<String>,

    #[arg(long, default_value = DEFAULT_BUSYBOX_IMAGE)]
    busybox_image: String,

    /// Walk the suite without running any test
    #[arg(long)]
    dry_run: bool,

    /// File overriding the registries of the test images
    #[arg(long)]
    test_repo_list: Option<PathBuf>,

    /// Registry all test images are pulled from
    #[arg(long)]
    test_repo: Option<String>,

    /// Extra e2e arguments, each --key=value
    #[arg(long, value_delimiter = ',')]
    extra_args: Vec<String>,

    /// Extra ginkgo arguments
    #[arg(long, value_delimiter = ',')]
    extra_ginkgo_args: Vec<String>,

    /// Seconds to wait for the workload to start
    #[arg(long, default_value_t = 300)]
    startup_timeout: u64,

    /// Reuse objects left behind by an earlier run instead of aborting
    #[arg(long)]
    skip_preflight: bool,

    /// With --skip-preflight, also reuse an existing repo-list ConfigMap
    #[arg(long, requires = "skip_preflight")]
    reuse_config_map: bool,

    #[arg(long)]
    disable_progress_status: bool,

    /// Seconds between progress updates
    #[arg(long, default_value_t = 30)]
    progress_status_interval: u64,

    /// Seconds to wait for the namespace to go away during cleanup
    #[arg(long)]
    namespace_delete_timeout: Option<u64>,

    /// Only delete what an earlier run left behind
    #[arg(long, conflicts_with = "list_images")]
    cleanup: bool,

    /// Print the images the suite would pull and exit
    #[arg(long)]
    list_images: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new()
            .namespace(self.namespace.as_str())
            .parallel(self.parallel)
            .verbosity(self.verbosity)
            .output_dir(&self.output_dir)
            .focus(self.focus.as_str())
            .skip(self.skip.as_str())
            .busybox_image(self.busybox_image.as_str())
            .dry_run(self.dry_run)
            .extra_args(self.extra_args.iter().cloned())
            .extra_ginkgo_args(self.extra_ginkgo_args.iter().cloned())
            .startup_timeout(Duration::from_secs(self.startup_timeout))
            .skip_preflight(self.skip_preflight)
            .disable_progress_status(self.disable_progress_status)
            .progress_status_interval(Duration::from_secs(self.progress_status_interval));

        if let Some(image) = &self.conformance_image {
            config = config.conformance_image(image.as_str());
        }
        if let Some(path) = &self.test_repo_list {
            config = config.test_repo_list(path);
        }
        if let Some(repo) = &self.test_repo {
            config = config.test_repo(repo.as_str());
        }
        if self.reuse_config_map {
            config = config.config_map_conflict(ConfigMapConflict::Reuse);
        }
        if let Some(secs) = self.namespace_delete_timeout {
            config = config.namespace_delete_timeout(Duration::from_secs(secs));
        }
        config
    }
}

async fn execute(cli: &Cli, cancel: CancellationToken) -> Result<ExitCode, RunError> {
    let kubeconfig = resolve_kubeconfig(cli.kubeconfig.as_deref());
    let cluster = Arc::new(KubeCluster::connect(kubeconfig.as_deref()).await?);
    let runner = TestRunner::new(cluster, cli.run_config());

    if cli.cleanup {
        runner.cleanup(cancel).await?;
        return Ok(ExitCode::SUCCESS);
    }

    if cli.list_images {
        let image = runner.conformance_image().await?;
        let images = runner.list_images(&image, cancel).await?;
        let mut stdout = tokio::io::stdout();
        for image in images {
            stdout.write_all(image.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut stdout = tokio::io::stdout();
    let status = runner.run(&mut stdout, cancel).await?;
    stdout.flush().await?;

    info!(status = %status, "Exit status");
    Ok(ExitCode::from(process_exit_code(status.process_code())))
}

/// Process exit codes are 8 bit; anything outside reads as a failure
fn process_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(u8::MAX)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init_logging(cli.debug);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            interrupt.cancel();
        }
    });

    match execute(&cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Conformance run failed");
            ExitCode::FAILURE
        }
    }
}

use super::TestRunner;
use crate::cluster::{ClusterApi, ClusterError};
use crate::manifests::{result_path, E2E_LOG_FILE, JUNIT_FILE, OUTPUT_CONTAINER, POD_NAME};
use std::path::PathBuf;
use tracing::info;

/// Errors from copying result files out of the workload
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to read {file} from the output container: {source}")]
    Fetch {
        file: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl<C: ClusterApi + 'static> TestRunner<C> {
    /// Copy `e2e.log` and `junit_01.xml` into the output directory
    pub async fn download_results(&self) -> Result<Vec<PathBuf>, DownloadError> {
        let dir = &self.config.output_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| DownloadError::Write {
                path: dir.clone(),
                source,
            })?;

        let mut written = Vec::new();
        for file in [E2E_LOG_FILE, JUNIT_FILE] {
            let dest = dir.join(file);
            info!(file = %file, dest = %dest.display(), "Downloading");

            let output = self
                .cluster
                .exec(
                    self.namespace(),
                    POD_NAME,
                    OUTPUT_CONTAINER,
                    vec!["cat".to_string(), result_path(file)],
                )
                .await
                .map_err(|source| DownloadError::Fetch {
                    file: file.to_string(),
                    source,
                })?;

            tokio::fs::write(&dest, output.stdout)
                .await
                .map_err(|source| DownloadError::Write {
                    path: dest.clone(),
                    source,
                })?;
            written.push(dest);
        }

        Ok(written)
    }
}

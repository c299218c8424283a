use async_trait::async_trait;
use job_client::{JobClient, JobManifest, JobPhase, JobResources};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::{BackendHandle, ExecutionBackend, JobSpec, WaitOutcome};
use crate::{error::Error, types::Language};

/// Settings for Jobs launched by [`ContainerBackend`]
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub resources: JobResources,
    /// Delay between two status polls
    pub poll_interval: Duration,
    /// Hard cap on a Job's lifetime regardless of the caller's deadline
    pub max_runtime: Duration,
    images: HashMap<Language, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            resources: JobResources::default(),
            poll_interval: Duration::from_secs(2),
            max_runtime: Duration::from_secs(10 * 60),
            images: HashMap::new(),
        }
    }
}

impl ContainerConfig {
    /// Override the image used for one language
    pub fn with_image(mut self, language: Language, image: impl Into<String>) -> Self {
        self.images.insert(language, image.into());
        self
    }

    pub fn with_resources(mut self, resources: JobResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    pub fn image_for(&self, spec: &JobSpec) -> String {
        self.images
            .get(&spec.language)
            .cloned()
            .unwrap_or_else(|| spec.toolchain().image.to_string())
    }
}

/// Runs each submission as an ephemeral Kubernetes Job.
///
/// The handle is the Job name. Source and stdin reach the container through
/// environment variables, and output is read from the log of the Job's pod.
pub struct ContainerBackend {
    client: Arc<JobClient>,
    config: ContainerConfig,
}

impl ContainerBackend {
    pub fn new(client: Arc<JobClient>, config: ContainerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    async fn poll(&self, name: &str) -> Result<WaitOutcome, Error> {
        loop {
            let status = self.client.job_status(name).await?;
            match status.phase() {
                JobPhase::Succeeded => return Ok(WaitOutcome::Succeeded),
                JobPhase::Failed => {
                    return Ok(WaitOutcome::Failed(format!(
                        "job failed ({} pod(s))",
                        status.failed
                    )))
                }
                JobPhase::Pending => {
                    debug!("Job {} still running ({} active)", name, status.active);
                    time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    async fn create(&self, spec: &JobSpec) -> Result<BackendHandle, Error> {
        let toolchain = spec.toolchain();
        let manifest = JobManifest::new(
            self.config.image_for(spec),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                toolchain.container_script(),
            ],
        )
        .with_env("SOURCE_CODE", spec.source.as_str())
        .with_env("STDIN_DATA", spec.stdin.as_deref().unwrap_or_default())
        .with_resources(self.config.resources.clone())
        .with_label("language", spec.language.name())
        .with_active_deadline(self.config.max_runtime);

        let name = self.client.create_job(&manifest).await?;
        debug!(
            "Created job {} for submission {} ({})",
            name, spec.submission_id, spec.language
        );
        Ok(BackendHandle::new(name))
    }

    async fn wait(&self, handle: &BackendHandle, deadline: Instant) -> Result<WaitOutcome, Error> {
        let limit = deadline.min(Instant::now() + self.config.max_runtime);

        tokio::select! {
            outcome = self.poll(handle.as_str()) => outcome,
            _ = time::sleep_until(limit) => {
                debug!("Job {} passed its deadline", handle);
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    async fn collect_output(&self, handle: &BackendHandle) -> Result<String, Error> {
        Ok(self.client.job_logs(handle.as_str()).await?)
    }

    async fn cleanup(&self, handle: &BackendHandle) {
        match self.client.delete_job(handle.as_str()).await {
            Ok(true) => debug!("Deleted job {}", handle),
            Ok(false) => debug!("Job {} was already gone", handle),
            Err(e) => warn!("Failed to delete job {}: {}", handle, e),
        }
    }
}

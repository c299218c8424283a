use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendHandle, BackendRegistry, ExecutionBackend, JobSpec, WaitOutcome},
    error::Error,
    queue::{publish_json, QueueClient},
    store::{ResultStore, DEFAULT_RESULT_TTL},
    types::{Language, ResultMessage, SubmissionMessage},
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock budget of one execution, measured from dispatch
    pub timeout: Duration,
    pub result_ttl: Duration,
    /// Queue that receives a [`ResultMessage`] per finished submission
    pub result_queue: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            result_ttl: DEFAULT_RESULT_TTL,
            result_queue: "executions".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_result_queue(mut self, queue: impl Into<String>) -> Self {
        self.result_queue = queue.into();
        self
    }
}

/// Lifecycle of one submission inside the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    InternalError,
    Cleaned,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::InternalError
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Dispatched => "dispatched",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed-out",
            JobState::InternalError => "internal-error",
            JobState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

/// Transient record of a submission being processed
#[derive(Debug)]
pub struct ExecutionJob {
    pub submission_id: String,
    pub backend_handle: Option<BackendHandle>,
    pub state: JobState,
    pub started_at: Option<Instant>,
    pub deadline: Option<Instant>,
    pub output: Option<String>,
    outcome: Option<JobState>,
}

impl ExecutionJob {
    fn new(submission_id: &str) -> Self {
        Self {
            submission_id: submission_id.to_string(),
            backend_handle: None,
            state: JobState::Queued,
            started_at: None,
            deadline: None,
            output: None,
            outcome: None,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug!("Job {}: {} -> {}", self.submission_id, self.state, next);
        if next.is_terminal() {
            self.outcome = Some(next);
        }
        self.state = next;
    }

    /// Terminal state reached before cleanup, if any
    pub fn outcome(&self) -> Option<JobState> {
        self.outcome
    }
}

/// What happened to one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub submission_id: String,
    /// Terminal state, or `None` when a stored result was replayed
    pub outcome: Option<JobState>,
    pub output: String,
}

/// Drives submissions through dispatch, wait, collect and cleanup.
///
/// Every submission that carries an id ends with exactly one write to the
/// result store and one published [`ResultMessage`], whatever went wrong on
/// the way. Nothing is retried.
pub struct Orchestrator {
    backends: BackendRegistry,
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn QueueClient>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        backends: BackendRegistry,
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn QueueClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backends,
            store,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Handle one raw intake payload. Returns `None` when the payload is not
    /// a submission at all, since there is no id to report under.
    pub async fn process(&self, payload: &[u8]) -> Option<JobReport> {
        match serde_json::from_slice::<SubmissionMessage>(payload) {
            Ok(submission) if !submission.id.is_empty() => Some(self.handle(&submission).await),
            Ok(_) => {
                error!("Dropping submission without id");
                None
            }
            Err(e) => {
                error!("Dropping unparseable submission: {}", e);
                None
            }
        }
    }

    pub async fn handle(&self, submission: &SubmissionMessage) -> JobReport {
        if let Some(output) = self.stored_result(&submission.id).await {
            info!("Submission {} already has a result, republishing", submission.id);
            self.publish(submission, &output).await;
            return JobReport {
                submission_id: submission.id.clone(),
                outcome: None,
                output,
            };
        }

        let mut job = ExecutionJob::new(&submission.id);
        let output = self.execute(&mut job, submission).await;
        job.output = Some(output.clone());

        if let Err(e) = self
            .store
            .set(&submission.id, &output, self.config.result_ttl)
            .await
        {
            error!("Failed to store result for {}: {}", submission.id, e);
        }
        self.publish(submission, &output).await;

        if let Some(handle) = &job.backend_handle {
            if let Some(backend) = self.backend_for(submission) {
                backend.cleanup(handle).await;
            }
            job.transition(JobState::Cleaned);
        }

        match job.outcome() {
            Some(JobState::Succeeded) => info!("Submission {} succeeded", submission.id),
            Some(state) => warn!("Submission {} finished as {}", submission.id, state),
            None => {}
        }

        JobReport {
            submission_id: job.submission_id,
            outcome: job.outcome,
            output,
        }
    }

    async fn stored_result(&self, id: &str) -> Option<String> {
        match self.store.get(id).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Result lookup for {} failed, executing anyway: {}", id, e);
                None
            }
        }
    }

    async fn publish(&self, submission: &SubmissionMessage, output: &str) {
        let message = ResultMessage {
            connection_id: submission.connection_id.clone(),
            output: output.to_string(),
        };
        if let Err(e) = publish_json(self.queue.as_ref(), &self.config.result_queue, &message).await {
            error!("Failed to publish result for {}: {}", submission.id, e);
        }
    }

    fn backend_for(&self, submission: &SubmissionMessage) -> Option<Arc<dyn ExecutionBackend>> {
        Language::from_id(submission.language_id).and_then(|language| self.backends.select(language))
    }

    /// Run the submission and return the text to report
    async fn execute(&self, job: &mut ExecutionJob, submission: &SubmissionMessage) -> String {
        let spec = match decode(submission) {
            Ok(spec) => spec,
            Err(e) => return internal_error(job, e),
        };
        let Some(backend) = self.backends.select(spec.language) else {
            return internal_error(
                job,
                Error::Backend(format!("no backend configured for {}", spec.language)),
            );
        };

        let started_at = Instant::now();
        let deadline = started_at + self.config.timeout;
        job.started_at = Some(started_at);
        job.deadline = Some(deadline);
        job.transition(JobState::Dispatched);

        let handle = match backend.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => return internal_error(job, e),
        };
        debug!("Submission {} runs on {} as {}", job.submission_id, backend.name(), handle);
        job.backend_handle = Some(handle.clone());
        job.transition(JobState::Running);

        match backend.wait(&handle, deadline).await {
            Ok(WaitOutcome::Succeeded) => match backend.collect_output(&handle).await {
                Ok(output) => {
                    job.transition(JobState::Succeeded);
                    output
                }
                Err(e) => internal_error(job, e),
            },
            Ok(WaitOutcome::Failed(reason)) => match backend.collect_output(&handle).await {
                Ok(output) => {
                    job.transition(JobState::Failed);
                    format!("Execution failed ({})\n{}", reason, output)
                }
                Err(e) => internal_error(job, e),
            },
            Ok(WaitOutcome::TimedOut) => {
                job.transition(JobState::TimedOut);
                let partial = match backend.collect_output(&handle).await {
                    Ok(partial) => partial,
                    Err(e) => {
                        debug!("No partial output for {}: {}", job.submission_id, e);
                        String::new()
                    }
                };
                format!(
                    "Execution timed out after {:?}\n{}",
                    self.config.timeout, partial
                )
            }
            Err(e) => internal_error(job, e),
        }
    }
}

fn decode(submission: &SubmissionMessage) -> Result<JobSpec, Error> {
    let language = Language::from_id(submission.language_id)
        .ok_or(Error::UnsupportedLanguage(submission.language_id))?;
    Ok(JobSpec {
        submission_id: submission.id.clone(),
        language,
        source: submission.decode_source()?,
        stdin: submission.decode_stdin()?,
    })
}

fn internal_error(job: &mut ExecutionJob, error: Error) -> String {
    error!("Submission {} failed internally: {}", job.submission_id, error);
    job.transition(JobState::InternalError);
    format!("Internal error: {}", error)
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
    error::Error,
    orchestrator::Orchestrator,
    queue::{AckMode, QueueClient},
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Intake queue to consume
    pub queue: String,
    /// Submissions processed at the same time
    pub concurrency: usize,
    pub ack_mode: AckMode,
    /// Pause after the subscription returns an error
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "submissions".to_string(),
            concurrency: 1,
            ack_mode: AckMode::OnReceive,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Bounded pool that feeds intake deliveries to the orchestrator.
///
/// A delivery is only taken from the queue once a slot is free, so at most
/// `concurrency` submissions are ever out of the queue and unfinished.
#[derive(Clone)]
pub struct ExecutionService {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn QueueClient>,
    semaphore: Arc<Semaphore>,
    permits: u32,
    config: WorkerConfig,
}

impl ExecutionService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn QueueClient>,
        config: WorkerConfig,
    ) -> Self {
        let permits = u32::try_from(config.concurrency.max(1)).unwrap_or(u32::MAX);

        Self {
            orchestrator,
            queue,
            semaphore: Arc::new(Semaphore::new(permits as usize)),
            permits,
            config,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Consume the intake queue until `shutdown` resolves, then wait for every
    /// in-flight submission. Fails only if the subscription cannot be opened.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let mut subscription = self
            .queue
            .consume(&self.config.queue, self.config.ack_mode)
            .await?;
        info!(
            "Execution workers consuming {} (concurrency {}, {:?})",
            self.config.queue, self.permits, self.config.ack_mode
        );

        tokio::pin!(shutdown);
        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.semaphore.clone().acquire_owned() => permit.map_err(|e| {
                    Error::Queue(format!("Failed to acquire execution permit: {}", e))
                })?,
            };

            let next = tokio::select! {
                _ = &mut shutdown => break,
                next = subscription.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!("Intake subscription ended");
                    break;
                }
                Err(e) => {
                    error!("Intake subscription failed: {}", e);
                    drop(permit);
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
            };

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Some(report) = orchestrator.process(delivery.payload()).await {
                    debug!("Finished {} ({:?})", report.submission_id, report.outcome);
                }
                if let Err(e) = delivery.ack().await {
                    warn!("Failed to acknowledge submission: {}", e);
                }
            });
        }

        info!("Waiting for in-flight executions to finish");
        let _drained = self.semaphore.acquire_many(self.permits).await;
        info!("Execution workers stopped");
        Ok(())
    }
}

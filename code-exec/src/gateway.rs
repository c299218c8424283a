use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    queue::{publish_json, QueueClient},
    rate_limit::SlidingWindowLimiter,
    types::SubmissionMessage,
};

/// Acknowledgment returned once a submission is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub id: String,
    pub message: String,
}

/// Entry point for new submissions: validate, admit, enqueue.
pub struct IngestionGateway {
    limiter: Arc<SlidingWindowLimiter>,
    queue: Arc<dyn QueueClient>,
    intake_queue: String,
}

impl IngestionGateway {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        queue: Arc<dyn QueueClient>,
        intake_queue: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            queue,
            intake_queue: intake_queue.into(),
        }
    }

    pub fn intake_queue(&self) -> &str {
        &self.intake_queue
    }

    /// Invalid submissions are rejected before they count against the rate
    /// limit, and nothing denied is ever published.
    pub async fn submit(&self, submission: SubmissionMessage) -> Result<SubmitAck, Error> {
        let language = submission.validate()?;

        if !self.limiter.allow() {
            warn!("Rate limit exceeded, rejecting submission {}", submission.id);
            return Err(Error::AdmissionDenied);
        }

        publish_json(self.queue.as_ref(), &self.intake_queue, &submission).await?;
        info!("Queued submission {} ({})", submission.id, language);
        debug!(
            "Submission {} will be answered on {}",
            submission.id, submission.connection_id
        );

        Ok(SubmitAck {
            id: submission.id,
            message: "Request submitted successfully".to_string(),
        })
    }
}

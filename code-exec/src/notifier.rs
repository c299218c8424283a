use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{queue::Subscription, registry::ConnectionRegistry, types::ResultMessage};

/// Pause before polling a subscription again after it returned an error
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Pushed,
    /// Nobody is listening; the caller pulls from the result store instead
    NoConnection,
    /// The push failed and the connection was dropped from the registry
    Failed,
}

/// Pushes finished results to whichever live connection asked for them.
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn deliver(&self, message: &ResultMessage) -> DeliveryOutcome {
        let Some(connection) = self.registry.lookup(&message.connection_id) else {
            debug!("No live connection for {}", message.connection_id);
            return DeliveryOutcome::NoConnection;
        };

        match connection.channel.push(message).await {
            Ok(()) => {
                debug!("Pushed result to {}", message.connection_id);
                DeliveryOutcome::Pushed
            }
            Err(e) => {
                warn!("Push to {} failed, dropping connection: {}", message.connection_id, e);
                self.registry
                    .unregister_if(&message.connection_id, connection.token);
                DeliveryOutcome::Failed
            }
        }
    }

    /// Deliver one raw result-queue payload
    pub async fn handle_payload(&self, payload: &[u8]) -> Option<DeliveryOutcome> {
        match serde_json::from_slice::<ResultMessage>(payload) {
            Ok(message) => Some(self.deliver(&message).await),
            Err(e) => {
                error!("Dropping unparseable result message: {}", e);
                None
            }
        }
    }

    /// Consume the result queue until `shutdown` resolves or the subscription ends
    pub async fn run<F>(&self, mut subscription: Box<dyn Subscription>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Notifier started");

        loop {
            let next = tokio::select! {
                _ = &mut shutdown => break,
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.handle_payload(delivery.payload()).await;
                    if let Err(e) = delivery.ack().await {
                        warn!("Failed to acknowledge result message: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Result subscription failed: {}", e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }

        info!("Notifier stopped");
    }
}

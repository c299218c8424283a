//! Durable publish/consume contract over named queues.
//!
//! Publishing returns once the broker has accepted the payload. Consuming
//! yields a lazy, unbounded sequence of [`Delivery`] values; whether a
//! delivery leaves the queue on receipt or only on [`Delivery::ack`] is chosen
//! per subscription with [`AckMode`].

mod memory;
mod redis_queue;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// When a consumed message is removed from its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Removed as soon as it is delivered; lost if the consumer crashes.
    #[default]
    OnReceive,
    /// Parked until acknowledged; redelivered if the consumer restarts first.
    AfterProcessing,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-receive" => Ok(AckMode::OnReceive),
            "after-processing" => Ok(AckMode::AfterProcessing),
            _ => Err(format!("Unknown ack mode: {}", s)),
        }
    }
}

/// Completes the acknowledgment of one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;
}

/// A single message handed to a consumer
pub struct Delivery {
    payload: Vec<u8>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgment
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            acker: None,
        }
    }

    pub fn with_acker(payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            acker: Some(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Remove the message from the broker for good. No-op for deliveries
    /// consumed in [`AckMode::OnReceive`].
    pub async fn ack(self) -> Result<(), Error> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.payload.len())
            .field("needs_ack", &self.acker.is_some())
            .finish()
    }
}

/// Lazy stream of deliveries from one queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the subscription has ended.
    async fn next(&mut self) -> Result<Option<Delivery>, Error>;
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Durably enqueue a payload
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), Error>;

    /// Start consuming a queue
    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Subscription>, Error>;
}

/// Serialize `message` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    client: &dyn QueueClient,
    queue: &str,
    message: &T,
) -> Result<(), Error> {
    let payload = serde_json::to_vec(message)?;
    client.publish(queue, &payload).await
}

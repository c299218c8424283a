use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Acknowledger, AckMode, Delivery, QueueClient, Subscription};
use crate::error::Error;

/// Queue backed by Redis lists.
///
/// Producers `LPUSH`, consumers pop from the right so each list is FIFO.
/// In [`AckMode::AfterProcessing`] a message is atomically moved with `BLMOVE`
/// into a processing list owned by this consumer and removed with `LREM` on
/// acknowledgment. Whatever is left in that list when the same consumer starts
/// again goes back to the queue.
#[derive(Clone)]
pub struct RedisQueue {
    client: Client,
    conn: ConnectionManager,
    consumer_id: String,
    block_timeout: Duration,
}

impl RedisQueue {
    /// Connect to Redis. `consumer_id` must be unique per running consumer and
    /// stable across its restarts for redelivery to find its parked messages.
    pub async fn connect(url: &str, consumer_id: impl Into<String>) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            consumer_id: consumer_id.into(),
            block_timeout: Duration::from_secs(1),
        })
    }

    /// Consumer id for a process that was not given one: the host name (the pod
    /// name under Kubernetes) or, failing that, a random id. Instances sharing
    /// one id would requeue each other's in-flight messages on startup.
    pub fn instance_consumer_id(hostname: Option<&str>) -> String {
        match hostname.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// How long a single blocking pop waits before it is re-issued
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    fn processing_list(&self, queue: &str) -> String {
        format!("{}:processing:{}", queue, self.consumer_id)
    }

    async fn recover(&self, queue: &str, processing: &str) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(processing)
                .arg(queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!("Published {} bytes to {}", payload.len(), queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Subscription>, Error> {
        let processing = match mode {
            AckMode::OnReceive => None,
            AckMode::AfterProcessing => {
                let processing = self.processing_list(queue);
                let recovered = self.recover(queue, &processing).await?;
                if recovered > 0 {
                    warn!(
                        "Requeued {} unacknowledged message(s) from {}",
                        recovered, processing
                    );
                }
                Some(processing)
            }
        };

        // Blocking pops get a connection of their own so they never stall publishers
        let blocking = self.client.get_multiplexed_async_connection().await?;
        info!("Consuming from {} ({:?})", queue, mode);

        Ok(Box::new(RedisSubscription {
            queue: queue.to_string(),
            client: self.client.clone(),
            blocking: Some(blocking),
            acks: self.conn.clone(),
            processing,
            block_secs: self.block_timeout.as_secs().max(1),
        }))
    }
}

struct RedisSubscription {
    queue: String,
    client: Client,
    blocking: Option<MultiplexedConnection>,
    acks: ConnectionManager,
    processing: Option<String>,
    block_secs: u64,
}

impl RedisSubscription {
    async fn pop(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.blocking.is_none() {
            self.blocking = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let conn = self
            .blocking
            .as_mut()
            .ok_or_else(|| Error::Queue(format!("no connection for {}", self.queue)))?;

        let result = match &self.processing {
            None => redis::cmd("BRPOP")
                .arg(&self.queue)
                .arg(self.block_secs)
                .query_async::<_, Option<(String, Vec<u8>)>>(conn)
                .await
                .map(|popped| popped.map(|(_, payload)| payload)),
            Some(processing) => redis::cmd("BLMOVE")
                .arg(&self.queue)
                .arg(processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(self.block_secs)
                .query_async::<_, Option<Vec<u8>>>(conn)
                .await,
        };

        result.map_err(|e| {
            // Reconnect on the next call
            self.blocking = None;
            Error::Redis(e)
        })
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, Error> {
        loop {
            let Some(payload) = self.pop().await? else {
                continue;
            };

            let delivery = match &self.processing {
                None => Delivery::new(payload),
                Some(processing) => {
                    let acker = RedisAcker {
                        conn: self.acks.clone(),
                        processing: processing.clone(),
                        payload: payload.clone(),
                    };
                    Delivery::with_acker(payload, Box::new(acker))
                }
            };
            return Ok(Some(delivery));
        }
    }
}

struct RedisAcker {
    conn: ConnectionManager,
    processing: String,
    payload: Vec<u8>,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&self.payload)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            warn!("Acknowledged message was no longer in {}", self.processing);
        }
        Ok(())
    }
}

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

use super::{Acknowledger, AckMode, Delivery, QueueClient, Subscription};
use crate::error::Error;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Inner {
    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        f(queues.entry(queue.to_string()).or_default())
    }
}

/// In-process queue with the same delivery semantics as the broker-backed one.
///
/// Used by the standalone mode and by tests. Nothing survives the process.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be delivered
    pub fn len(&self, queue: &str) -> usize {
        self.inner.with_queue(queue, |state| state.ready.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Messages delivered in [`AckMode::AfterProcessing`] and not yet acknowledged
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner.with_queue(queue, |state| state.unacked.len())
    }

    /// Put every unacknowledged message back at the head of the queue, as a
    /// broker does when a consumer goes away.
    pub fn requeue_unacked(&self, queue: &str) -> usize {
        self.inner.with_queue(queue, |state| {
            let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));
            let count = tags.len();
            for tag in tags {
                if let Some(payload) = state.unacked.remove(&tag) {
                    state.ready.push_front(payload);
                    state.notify.notify_one();
                }
            }
            count
        })
    }

    /// Drain all waiting messages without acknowledgment bookkeeping
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .with_queue(queue, |state| state.ready.drain(..).collect())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), Error> {
        self.inner.with_queue(queue, |state| {
            state.ready.push_back(payload.to_vec());
            state.notify.notify_one();
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Subscription>, Error> {
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            mode,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    mode: AckMode,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, Error> {
        loop {
            let mode = self.mode;
            let (taken, notify) = self.inner.with_queue(&self.queue, |state| {
                let taken = state.ready.pop_front().map(|payload| {
                    let tag = match mode {
                        AckMode::OnReceive => None,
                        AckMode::AfterProcessing => {
                            state.next_tag += 1;
                            state.unacked.insert(state.next_tag, payload.clone());
                            Some(state.next_tag)
                        }
                    };
                    (payload, tag)
                });
                (taken, state.notify.clone())
            });

            match taken {
                Some((payload, None)) => return Ok(Some(Delivery::new(payload))),
                Some((payload, Some(tag))) => {
                    let acker = MemoryAcker {
                        inner: self.inner.clone(),
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Ok(Some(Delivery::with_acker(payload, Box::new(acker))));
                }
                // A permit stored by a publish that raced with us wakes this
                // immediately; an empty re-check just loops.
                None => notify.notified().await,
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.inner.with_queue(&self.queue, |state| {
            state.unacked.remove(&self.tag);
        });
        Ok(())
    }
}

//! TTL-keyed record of the last result per submission, for pull retrieval.

mod memory;
mod redis_store;

pub use self::memory::MemoryResultStore;
pub use self::redis_store::RedisResultStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Error;

/// How long a result stays retrievable unless configured otherwise
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Key/value store whose entries expire.
///
/// Reading a key after its TTL has elapsed is indistinguishable from reading a
/// key that was never written. Concurrent writes to one key are last-write-wins.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;
}

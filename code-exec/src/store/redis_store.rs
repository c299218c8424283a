use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::debug;

use super::ResultStore;
use crate::error::Error;

/// Result store on Redis string keys with millisecond expiry
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
}

impl RedisResultStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        debug!("Stored result for {} (ttl {}ms)", key, ttl_ms);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::{skip_if_not_available, RedisServer};

    #[tokio::test]
    async fn stores_reads_and_deletes() {
        if skip_if_not_available(&["redis-server"]) {
            return;
        }
        let server = RedisServer::start().await;
        let store = RedisResultStore::connect(server.url()).await.unwrap();

        assert_eq!(store.get("r1").await.unwrap(), None);
        store.set("r1", "2\n", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("r1").await.unwrap().as_deref(), Some("2\n"));

        store.set("r1", "3\n", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("r1").await.unwrap().as_deref(), Some("3\n"));

        tokio_test::assert_ok!(store.delete("r1").await);
        assert_eq!(store.get("r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        if skip_if_not_available(&["redis-server"]) {
            return;
        }
        let server = RedisServer::start().await;
        let store = RedisResultStore::connect(server.url()).await.unwrap();

        store.set("r1", "2\n", Duration::from_millis(100)).await.unwrap();
        assert!(store.get("r1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.get("r1").await.unwrap(), None);
    }
}

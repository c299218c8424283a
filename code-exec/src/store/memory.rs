use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::ResultStore;
use crate::error::Error;

/// Process-local result store. Expired entries are dropped lazily on read.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((_, expires_at)) if Instant::now() >= *expires_at => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_read_as_absent() {
        let store = MemoryResultStore::new();
        store.set("r1", "2\n", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.get("r1").await.unwrap().as_deref(), Some("2\n"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("r1").await.unwrap(), None);
        assert_eq!(store.get("never-written").await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = MemoryResultStore::new();
        store.set("r1", "first", Duration::from_secs(60)).await.unwrap();
        store.set("r1", "second", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("r1").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryResultStore::new();
        store.set("r1", "out", Duration::from_secs(60)).await.unwrap();
        store.delete("r1").await.unwrap();
        store.delete("r1").await.unwrap();

        assert_eq!(store.get("r1").await.unwrap(), None);
    }
}

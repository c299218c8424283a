use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::{error::Error, types::ResultMessage};

/// Live channel a result can be pushed down
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn push(&self, message: &ResultMessage) -> Result<(), Error>;
}

/// A registered channel together with the token issued at registration
#[derive(Clone)]
pub struct Connection {
    pub token: u64,
    pub channel: Arc<dyn PushChannel>,
}

/// Map from correlation id to the one live channel registered under it.
///
/// Registering an id that is already present replaces the previous channel
/// without closing it; its owner finds out when its own socket ends. Each
/// registration gets a fresh token so an owner can unregister only while it is
/// still the current one.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    next_token: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, connection_id: &str, channel: Arc<dyn PushChannel>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self
            .lock()
            .insert(connection_id.to_string(), Connection { token, channel });
        if previous.is_some() {
            debug!("Connection {} superseded by a new registration", connection_id);
        }
        token
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        self.lock().remove(connection_id).is_some()
    }

    /// Remove the entry only if it still carries `token`
    pub fn unregister_if(&self, connection_id: &str, token: u64) -> bool {
        let mut connections = self.lock();
        match connections.get(connection_id) {
            Some(current) if current.token == token => {
                connections.remove(connection_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, connection_id: &str) -> Option<Connection> {
        self.lock().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

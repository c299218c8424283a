use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use code_exec::{ConnectionRegistry, PushChannel, ResultMessage};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Status frame sent to a client right after it connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub message: String,
    pub connection_id: String,
}

impl ConnectionStatus {
    pub fn connected(connection_id: &str) -> Self {
        Self {
            status: "connected".to_string(),
            message: "You are successfully connected".to_string(),
            connection_id: connection_id.to_string(),
        }
    }
}

/// Write half of a websocket, registered as the push target of one connection
pub struct WsPushChannel<S> {
    sink: Mutex<S>,
}

impl<S> WsPushChannel<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl<S> PushChannel for WsPushChannel<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    async fn push(&self, message: &ResultMessage) -> Result<(), code_exec::Error> {
        let text = serde_json::to_string(message)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| code_exec::Error::Delivery(e.to_string()))
    }
}

/// Serve one upgraded connection until the client goes away
pub(crate) async fn handle_socket(
    socket: WebSocket,
    connection_id: String,
    registry: Arc<ConnectionRegistry>,
) {
    let (mut sender, mut receiver) = socket.split();

    let greeting = match serde_json::to_string(&ConnectionStatus::connected(&connection_id)) {
        Ok(greeting) => greeting,
        Err(e) => {
            warn!("Failed to encode connected message: {}", e);
            return;
        }
    };
    if let Err(e) = sender.send(Message::Text(greeting)).await {
        warn!("Error sending connected message to {}: {}", connection_id, e);
        return;
    }

    let token = registry.register(&connection_id, Arc::new(WsPushChannel::new(sender)));
    info!("Websocket connected: {}", connection_id);

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => debug!("Received from {}: {}", connection_id, text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Websocket {} read error: {}", connection_id, e);
                break;
            }
        }
    }

    registry.unregister_if(&connection_id, token);
    info!("Websocket disconnected: {}", connection_id);
}

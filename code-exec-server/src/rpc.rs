//! Newline-delimited JSON-RPC submit endpoint over plain TCP.
//!
//! Each request line is `{"id": .., "method": "submit", "params": <submission>}`
//! and is answered by exactly one response line carrying the same `id`.
//! A line longer than [`MAX_LINE_BYTES`] is answered with a parse error and
//! the connection is closed.

use code_exec::{IngestionGateway, SubmissionMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Submission rejected by the rate limiter
pub const RATE_LIMITED: i64 = 429;

/// Longest accepted request line, matching the HTTP body limit
pub const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Answer one request line
pub async fn dispatch(gateway: &IngestionGateway, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e))
        }
    };

    match request.method.as_str() {
        "submit" => {
            let submission: SubmissionMessage = match serde_json::from_value(request.params) {
                Ok(submission) => submission,
                Err(e) => {
                    return RpcResponse::failure(
                        request.id,
                        INVALID_PARAMS,
                        format!("Invalid params: {}", e),
                    )
                }
            };

            match gateway.submit(submission).await {
                Ok(ack) => match serde_json::to_value(&ack) {
                    Ok(result) => RpcResponse::success(request.id, result),
                    Err(e) => RpcResponse::failure(request.id, INTERNAL_ERROR, e.to_string()),
                },
                Err(code_exec::Error::AdmissionDenied) => {
                    RpcResponse::failure(request.id, RATE_LIMITED, "Too many requests")
                }
                Err(e) if e.is_client_error() => {
                    RpcResponse::failure(request.id, INVALID_PARAMS, e.to_string())
                }
                Err(e) => {
                    error!("RPC submit failed: {}", e);
                    RpcResponse::failure(request.id, INTERNAL_ERROR, "Internal server error")
                }
            }
        }
        other => RpcResponse::failure(
            request.id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        ),
    }
}

/// Accept RPC connections until `shutdown` resolves
pub async fn serve_rpc<F>(listener: TcpListener, gateway: Arc<IngestionGateway>, shutdown: F)
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Starting RPC listener on {}", addr);
    }
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("RPC connection from {}", peer);
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &gateway, MAX_LINE_BYTES).await {
                        debug!("RPC connection from {} closed: {}", peer, e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept RPC connection: {}", e),
        }
    }

    info!("RPC listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    gateway: &IngestionGateway,
    max_line: usize,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(max_line as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }

        if line.len() > max_line && line.last() != Some(&b'\n') {
            warn!("RPC request line exceeds {} bytes, closing connection", max_line);
            let response = RpcResponse::failure(
                Value::Null,
                PARSE_ERROR,
                format!("Request line exceeds {} bytes", max_line),
            );
            write_response(&mut writer, &response).await?;
            return Ok(());
        }

        let response = match std::str::from_utf8(&line) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => dispatch(gateway, text.trim_end()).await,
            Err(e) => RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)),
        };
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(response)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use code_exec::queue::MemoryQueue;
    use code_exec::{Language, SlidingWindowLimiter};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn gateway(queue: &MemoryQueue, max_requests: usize) -> IngestionGateway {
        let limiter = SlidingWindowLimiter::new(max_requests, Duration::from_secs(60));
        IngestionGateway::new(Arc::new(limiter), Arc::new(queue.clone()), "submissions")
    }

    fn submit_line(id: Value, submission_id: &str) -> String {
        let submission =
            SubmissionMessage::from_source(submission_id, Language::Python, "print(1+1)", "c1");
        json!({ "id": id, "method": "submit", "params": submission }).to_string()
    }

    #[tokio::test]
    async fn submit_is_acknowledged() {
        let queue = MemoryQueue::new();
        let response = dispatch(&gateway(&queue, 10), &submit_line(json!(7), "r1")).await;

        assert_eq!(response.id, json!(7));
        assert!(response.error.is_none());
        assert_eq!(
            response.result.unwrap()["message"],
            "Request submitted successfully"
        );
        assert_eq!(queue.len("submissions"), 1);
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let queue = MemoryQueue::new();
        let gateway = gateway(&queue, 1);

        let garbage = dispatch(&gateway, "{oops").await;
        assert_eq!(garbage.error.unwrap().code, PARSE_ERROR);

        let unknown = dispatch(&gateway, r#"{"id":"a","method":"cancel"}"#).await;
        assert_eq!(unknown.id, json!("a"));
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let invalid = dispatch(&gateway, r#"{"id":1,"method":"submit","params":{}}"#).await;
        assert_eq!(invalid.error.unwrap().code, INVALID_PARAMS);

        dispatch(&gateway, &submit_line(json!(2), "r1")).await;
        let limited = dispatch(&gateway, &submit_line(json!(3), "r2")).await;
        assert_eq!(limited.error.unwrap().code, RATE_LIMITED);
    }

    #[tokio::test]
    async fn serves_requests_over_tcp() {
        let queue = MemoryQueue::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_rpc(
            listener,
            Arc::new(gateway(&queue, 10)),
            async {
                let _ = stopped.await;
            },
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        for (id, submission_id) in [(1, "r1"), (2, "r2")] {
            let mut line = submit_line(json!(id), submission_id);
            line.push('\n');
            writer.write_all(line.as_bytes()).await.unwrap();

            let reply = lines.next_line().await.unwrap().unwrap();
            let response: RpcResponse = serde_json::from_str(&reply).unwrap();
            assert_eq!(response.id, json!(id));
            assert!(response.result.is_some());
        }

        stop.send(()).unwrap();
        server.await.unwrap();
        assert_eq!(queue.len("submissions"), 2);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_and_closed() {
        let queue = MemoryQueue::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn({
            let gateway = gateway(&queue, 10);
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                handle_connection(stream, &gateway, 64).await
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // One byte past the limit and no newline
        writer.write_all(&[b'x'; 65]).await.unwrap();

        let reply = lines.next_line().await.unwrap().unwrap();
        let response: RpcResponse = serde_json::from_str(&reply).unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
        assert_eq!(lines.next_line().await.unwrap(), None);

        tokio_test::assert_ok!(server.await.unwrap());
        assert!(queue.is_empty("submissions"));
    }

    #[tokio::test]
    async fn line_at_the_limit_is_served() {
        let queue = MemoryQueue::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut request = submit_line(json!(1), "r1");
        let limit = request.len();
        request.push('\n');

        let server = tokio::spawn({
            let gateway = gateway(&queue, 10);
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                handle_connection(stream, &gateway, limit).await
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(request.as_bytes()).await.unwrap();

        let reply = lines.next_line().await.unwrap().unwrap();
        let response: RpcResponse = serde_json::from_str(&reply).unwrap();
        assert!(response.result.is_some());

        drop(writer);
        tokio_test::assert_ok!(server.await.unwrap());
        assert_eq!(queue.len("submissions"), 1);
    }
}

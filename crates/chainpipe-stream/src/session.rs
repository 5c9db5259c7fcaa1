//! A single WebSocket connection speaking JSON-RPC 2.0.
//!
//! `WsSession` owns both halves of the socket. Responses are matched by
//! request id; notifications that arrive while a request is in flight are
//! queued and returned by the next [`WsSession::next_json`] call, so nothing
//! received during a subscription handshake is lost. The queue is bounded:
//! overflowing it ends the session with an error, and the caller reconnects
//! from its last position.

use std::collections::VecDeque;
use std::time::Duration;

use chainpipe_core::{ConnectError, SourceConfig};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::credentials::resolve_endpoint;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Timeouts for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Notifications held while a request is in flight.
    pub backlog_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            backlog_limit: 10_000,
        }
    }
}

pub struct WsSession {
    /// Endpoint as configured (placeholder intact), safe to log.
    endpoint: String,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    next_id: u64,
    backlog: VecDeque<Value>,
    backlog_limit: usize,
    request_timeout: Duration,
}

impl WsSession {
    /// Dial the source's endpoint, injecting its credential.
    pub async fn connect(source: &SourceConfig, config: SessionConfig) -> Result<Self, ConnectError> {
        let resolved = resolve_endpoint(source)?;
        let endpoint = source.endpoint.clone();
        let failed = |reason: String| ConnectError::Failed {
            endpoint: endpoint.clone(),
            reason,
        };

        let mut request = resolved
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| failed(e.to_string()))?;
        if let Some(token) = &resolved.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| failed("credential is not a valid header value".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint: endpoint.clone(),
                ms: config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| failed(e.to_string()))?;

        info!(source_id = %source.id, endpoint = %endpoint, "WebSocket connected");
        let (sink, stream) = ws.split();
        Ok(Self {
            endpoint,
            sink,
            stream,
            next_id: 1,
            backlog: VecDeque::new(),
            backlog_limit: config.backlog_limit.max(1),
            request_timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Notifications queued behind an in-flight request.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn closed(&self) -> ConnectError {
        ConnectError::Closed {
            endpoint: self.endpoint.clone(),
        }
    }

    pub async fn send_text(&mut self, text: String) -> Result<(), ConnectError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectError::Failed {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), ConnectError> {
        self.send_text(value.to_string()).await
    }

    /// Send a JSON-RPC request and wait for its response `result`.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, ConnectError> {
        let id = self.next_id;
        self.next_id += 1;
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.send_json(&msg).await?;

        let timeout = self.request_timeout;
        let endpoint = self.endpoint.clone();
        tokio::time::timeout(timeout, self.await_response(id))
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint,
                ms: timeout.as_millis() as u64,
            })?
    }

    async fn await_response(&mut self, id: u64) -> Result<Value, ConnectError> {
        loop {
            let text = self.next_text().await?;
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                debug!(endpoint = %self.endpoint, "ignoring non-JSON frame");
                continue;
            };
            if value.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(err) = value.get("error") {
                    return Err(ConnectError::Rpc {
                        endpoint: self.endpoint.clone(),
                        message: err.to_string(),
                    });
                }
                return Ok(value.get("result").cloned().unwrap_or(Value::Null));
            }
            if self.backlog.len() >= self.backlog_limit {
                warn!(
                    endpoint = %self.endpoint,
                    limit = self.backlog_limit,
                    "notification backlog full, dropping session"
                );
                return Err(ConnectError::Failed {
                    endpoint: self.endpoint.clone(),
                    reason: format!("notification backlog exceeded {} messages", self.backlog_limit),
                });
            }
            self.backlog.push_back(value);
        }
    }

    /// Next text frame. Ping frames are answered; a close frame or the end of
    /// the stream yields [`ConnectError::Closed`].
    pub async fn next_text(&mut self) -> Result<String, ConnectError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Err(self.closed()),
                Some(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "WebSocket error");
                    return Err(ConnectError::Failed {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(text),
                    Err(_) => debug!(endpoint = %self.endpoint, "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.sink.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next JSON message, queued notifications first.
    pub async fn next_json(&mut self) -> Result<Value, ConnectError> {
        if let Some(value) = self.backlog.pop_front() {
            return Ok(value);
        }
        loop {
            let text = self.next_text().await?;
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => return Ok(value),
                Err(e) => debug!(endpoint = %self.endpoint, error = %e, "ignoring non-JSON frame"),
            }
        }
    }
}

/// Extract `params.result` from a subscription notification with the given
/// method name (`eth_subscription`, `logsNotification`, ...).
pub fn notification_result<'a>(message: &'a Value, method: &str) -> Option<&'a Value> {
    if message.get("method")?.as_str()? != method {
        return None;
    }
    message.get("params")?.get("result")
}

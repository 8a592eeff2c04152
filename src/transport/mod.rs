//! Per-venue transport: one pooled HTTP client and one long-lived
//! WebSocket, plus the shared inbound frame queue (§4.1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A decoded inbound WebSocket frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub request_id: Option<u64>,
    pub payload: Value,
}

/// Owns one HTTP client and one WebSocket for a single venue.
pub struct Transport {
    venue: String,
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    ws_writer: Mutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>,
    open: AtomicBool,
    next_request_id: AtomicU64,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Mutex<mpsc::Receiver<InboundFrame>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    #[must_use]
    pub fn new(venue: impl Into<String>, base_url: impl Into<String>, ws_url: impl Into<String>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(4096);
        Arc::new(Self {
            venue: venue.into(),
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            ws_writer: Mutex::new(None),
            open: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            listener: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Dial the WebSocket and spawn the background listener task.
    /// Idempotent: a second call while already open is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let (stream, _) = tokio_tungstenite::connect_async(&self.ws_url).await?;
        let (writer, mut reader) = stream.split();
        *self.ws_writer.lock().await = Some(writer);
        self.open.store(true, Ordering::SeqCst);

        let venue = self.venue.clone();
        let tx = self.inbound_tx.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(payload) => {
                            let request_id = payload.get("id").and_then(Value::as_u64);
                            if tx.send(InboundFrame { request_id, payload }).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%venue, %err, "failed to decode inbound frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => {
                        info!(%venue, "websocket closed, marking transport closed");
                        this.open.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
            this.open.store(false, Ordering::SeqCst);
        });
        *self.listener.lock().await = Some(handle);

        info!(venue = %self.venue, "transport connected");
        Ok(())
    }

    /// Release the socket, cancel the listener, and mark the transport
    /// closed. Idempotent.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        *self.ws_writer.lock().await = None;
        info!(venue = %self.venue, "transport closed");
    }

    /// Send a JSON frame over the WebSocket, assigning a monotonic
    /// request id. Fails with `Error::Transport` if the socket is gone.
    pub async fn ws_send(&self, mut frame: Value) -> Result<u64> {
        if !self.is_open() {
            return Err(Error::Transport {
                venue: self.venue.clone(),
                source: anyhow::anyhow!("websocket closed"),
            });
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("id".to_string(), Value::from(request_id));
        }
        let mut writer = self.ws_writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.send(Message::Text(frame.to_string())).await?;
                Ok(request_id)
            }
            None => Err(Error::Transport {
                venue: self.venue.clone(),
                source: anyhow::anyhow!("websocket closed"),
            }),
        }
    }

    /// Lock the shared inbound queue for draining.
    pub async fn ws_inbound(&self) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<InboundFrame>> {
        self.inbound_rx.lock().await
    }

    async fn request(&self, method: Method, endpoint: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{endpoint}", self.base_url);
        let mut builder = self.http.request(method, &url).query(params);
        for (key, value) in headers {
            builder = builder.header(*key, *value);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(venue = %self.venue, %endpoint, %status, "http request failed");
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::AuthFailed {
                    venue: self.venue.clone(),
                    reason: body,
                });
            }
            return Err(Error::HttpStatus {
                venue: self.venue.clone(),
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn get(&self, endpoint: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::GET, endpoint, params, headers).await
    }

    pub async fn post(&self, endpoint: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::POST, endpoint, params, headers).await
    }

    pub async fn put(&self, endpoint: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::PUT, endpoint, params, headers).await
    }

    pub async fn delete(&self, endpoint: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::DELETE, endpoint, params, headers).await
    }

    /// Concurrent lightweight GET + WS ping; fails fast on either error.
    pub async fn check_connection(&self, timeout: Duration) -> Result<()> {
        let http_check = tokio::time::timeout(timeout, self.get("/ping", &[], &[]));
        let is_open = self.is_open();
        let (http_result,) = tokio::join!(http_check);
        http_result.map_err(|_| Error::Transport {
            venue: self.venue.clone(),
            source: anyhow::anyhow!("connection check timed out"),
        })??;
        if !is_open {
            return Err(Error::Transport {
                venue: self.venue.clone(),
                source: anyhow::anyhow!("websocket not open"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_transport_starts_closed() {
        let transport = Transport::new("test", "http://localhost", "ws://localhost");
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn ws_send_fails_when_closed() {
        let transport = Transport::new("test", "http://localhost", "ws://localhost");
        let err = transport.ws_send(serde_json::json!({"op": "ping"})).await;
        assert!(err.is_err());
    }
}

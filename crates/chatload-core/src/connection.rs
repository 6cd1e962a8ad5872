use crate::error::ConnectionError;
use crate::metrics::Metrics;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A persistent, exclusively owned connection to one logical room.
///
/// At most one request is in flight: `send_and_wait` resolves before the next send.
pub trait Connection: Send {
    fn room(&self) -> u32;

    fn is_open(&self) -> bool;

    /// Send `payload` and return the first frame that arrives afterwards,
    /// or `None` if nothing arrives within `timeout`.
    fn send_and_wait<'a>(
        &'a mut self,
        payload: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>, ConnectionError>>;

    /// Best-effort close; never fails.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens connections to the target. One implementation per transport.
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn endpoint(&self, room: u32) -> String;

    fn connect(&self, room: u32) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>>;
}

/// Opens and replaces connections, bounding the handshake and counting
/// connections in the shared metrics.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    metrics: Arc<Metrics>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, metrics: Arc<Metrics>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            metrics,
            connect_timeout,
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub async fn open(&self, room: u32) -> Result<Box<dyn Connection>, ConnectionError> {
        let conn = self.handshake(room).await?;
        self.metrics.record_connection();
        Ok(conn)
    }

    /// Close `old` and open a fresh connection to the same room.
    ///
    /// `old` is consumed, so a failed reconnect leaves the caller with no connection.
    pub async fn reconnect(
        &self,
        mut old: Box<dyn Connection>,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let room = old.room();
        old.close().await;
        drop(old);

        self.reopen(room).await
    }

    /// Open a replacement for a connection that was already lost, counting it as a reconnection.
    pub async fn reopen(&self, room: u32) -> Result<Box<dyn Connection>, ConnectionError> {
        let conn = self.handshake(room).await?;
        self.metrics.record_reconnection();
        self.metrics.record_connection();
        Ok(conn)
    }

    async fn handshake(&self, room: u32) -> Result<Box<dyn Connection>, ConnectionError> {
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(room)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                url: self.connector.endpoint(room),
                timeout: self.connect_timeout,
            }),
        }
    }
}

/// Plain-text WebSocket connector; connects to `{base_url}/chat/{room}`.
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConnectionError> {
        let base_url = base_url.into();
        let parsed = url::Url::parse(&base_url).map_err(|e| ConnectionError::InvalidUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "ws" => {}
            "wss" => {
                return Err(ConnectionError::InvalidUrl {
                    url: base_url,
                    reason: "wss is not supported, this client is built without TLS".to_string(),
                })
            }
            other => {
                return Err(ConnectionError::InvalidUrl {
                    url: base_url,
                    reason: format!("unsupported scheme '{other}', expected ws"),
                })
            }
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl Connector for WsConnector {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn endpoint(&self, room: u32) -> String {
        format!("{}/chat/{}", self.base_url, room)
    }

    fn connect(&self, room: u32) -> BoxFuture<'_, Result<Box<dyn Connection>, ConnectionError>> {
        Box::pin(async move {
            let url = self.endpoint(room);
            let (stream, _response) =
                connect_async(url.as_str())
                    .await
                    .map_err(|e| ConnectionError::Handshake {
                        url: url.clone(),
                        reason: e.to_string(),
                    })?;
            debug!("Connected to {}", url);

            Ok(Box::new(WsConnection {
                stream,
                room,
                open: true,
            }) as Box<dyn Connection>)
        })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    room: u32,
    open: bool,
}

impl WsConnection {
    /// Discard frames that arrived before this request was armed.
    fn drain_stale(&mut self) {
        while let Some(frame) = self.stream.next().now_or_never() {
            match frame {
                Some(Ok(Message::Close(_))) | None => {
                    self.open = false;
                    break;
                }
                Some(Err(e)) => {
                    debug!("Transport error while draining: {}", e);
                    self.open = false;
                    break;
                }
                Some(Ok(_)) => debug!("Discarding stale frame on room {}", self.room),
            }
        }
    }

    async fn next_reply(&mut self) -> Result<String, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.open = false;
                    return Err(ConnectionError::Closed);
                }
                // ping/pong are answered by the protocol layer
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    return Err(ConnectionError::Transport(e.to_string()));
                }
            }
        }
    }
}

impl Connection for WsConnection {
    fn room(&self) -> u32 {
        self.room
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send_and_wait<'a>(
        &'a mut self,
        payload: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<String>, ConnectionError>> {
        Box::pin(async move {
            self.drain_stale();
            if !self.open {
                return Err(ConnectionError::Closed);
            }

            if let Err(e) = self.stream.send(Message::Text(payload.to_string())).await {
                self.open = false;
                return Err(ConnectionError::Transport(e.to_string()));
            }

            match tokio::time::timeout(timeout, self.next_reply()).await {
                Ok(Ok(reply)) => Ok(Some(reply)),
                Ok(Err(e)) => Err(e),
                Err(_) => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.open {
                return;
            }
            self.open = false;
            match tokio::time::timeout(CLOSE_GRACE, self.stream.close(None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close on room {} failed: {}", self.room, e),
                Err(_) => warn!("Close on room {} timed out", self.room),
            }
        })
    }
}

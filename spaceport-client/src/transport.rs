//! Transport layer for the queued submission path.
//!
//! Provides implementations of [`QueueTransport`]:
//! - [`WebSocketTransport`]: a `tokio-tungstenite` client socket
//! - [`ChannelTransport`]: in-process tokio mpsc channels (for testing)

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use spaceport_core::error::SubmitError;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

/// What the transport delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One text frame.
    Text(String),
    /// The connection ended. `clean` is true when the peer completed a
    /// closing handshake.
    Closed { clean: bool },
}

/// One bidirectional connection to the queue.
#[async_trait]
pub trait QueueTransport: Send {
    /// Wait for the next frame. After `Closed` is returned the transport is spent.
    async fn recv(&mut self) -> Inbound;

    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<(), SubmitError>;

    /// Close the connection. Idempotent.
    async fn close(&mut self);
}

/// Opens queue connections.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueTransport>, SubmitError>;
}

// ---------------------------------------------------------------------------
// WebSocketTransport
// ---------------------------------------------------------------------------

/// Queue transport over a client WebSocket.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl QueueTransport for WebSocketTransport {
    async fn recv(&mut self) -> Inbound {
        if self.closed {
            return Inbound::Closed { clean: true };
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Inbound::Text(text),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Inbound::Text(text),
                    Err(_) => debug!("Dropping non-UTF-8 binary queue frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Queue socket closed by server");
                    self.closed = true;
                    return Inbound::Closed { clean: true };
                }
                Some(Ok(other)) => trace!(?other, "Skipping control frame"),
                Some(Err(e)) => {
                    debug!(error = %e, "Queue socket errored");
                    self.closed = true;
                    return Inbound::Closed { clean: false };
                }
                None => {
                    self.closed = true;
                    return Inbound::Closed { clean: false };
                }
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), SubmitError> {
        self.stream
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| SubmitError::Transport {
                message: format!("websocket send failed: {e}"),
            })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error while closing queue socket");
        }
    }
}

/// Connects [`WebSocketTransport`]s with a connect timeout.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl QueueConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueTransport>, SubmitError> {
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| SubmitError::Connection {
                message: format!("timed out connecting to {url}"),
            })?
            .map_err(|e| SubmitError::Connection {
                message: e.to_string(),
            })?;
        debug!(url, "Queue socket connected");
        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// In-process queue transport backed by tokio mpsc channels.
///
/// Lets the full submission pipeline run against a scripted peer without a
/// socket.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<String>,
    closed: bool,
}

/// The scripted side of a [`ChannelTransport`].
pub struct ChannelPeer {
    /// Frames the client sent.
    pub sent: mpsc::Receiver<String>,
    /// Frames and closures to deliver to the client.
    pub deliver: mpsc::Sender<Inbound>,
}

impl ChannelPeer {
    /// Deliver a text frame.
    pub async fn push(&self, frame: impl Into<String>) -> bool {
        self.deliver.send(Inbound::Text(frame.into())).await.is_ok()
    }
}

impl ChannelTransport {
    /// Create a linked transport/peer pair. `buffer` bounds each direction.
    pub fn pair(buffer: usize) -> (Self, ChannelPeer) {
        let (deliver, inbound) = mpsc::channel(buffer);
        let (outbound, sent) = mpsc::channel(buffer);
        (
            ChannelTransport {
                inbound,
                outbound,
                closed: false,
            },
            ChannelPeer { sent, deliver },
        )
    }
}

#[async_trait]
impl QueueTransport for ChannelTransport {
    async fn recv(&mut self) -> Inbound {
        if self.closed {
            return Inbound::Closed { clean: true };
        }
        match self.inbound.recv().await {
            Some(inbound) => inbound,
            // Peer dropped without a closing handshake.
            None => Inbound::Closed { clean: false },
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), SubmitError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|e| SubmitError::Transport {
                message: format!("channel send failed: {e}"),
            })
    }

    async fn close(&mut self) {
        self.closed = true;
        self.inbound.close();
    }
}

/// Hands out pre-built transports in order. Connecting past the last one fails.
#[derive(Default)]
pub struct ChannelConnector {
    transports: Mutex<Vec<ChannelTransport>>,
    urls: Mutex<Vec<String>>,
}

impl ChannelConnector {
    pub fn new(transports: Vec<ChannelTransport>) -> Self {
        Self {
            transports: Mutex::new(transports),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// URLs passed to `connect`, in call order.
    pub async fn urls(&self) -> Vec<String> {
        self.urls.lock().await.clone()
    }
}

#[async_trait]
impl QueueConnector for ChannelConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn QueueTransport>, SubmitError> {
        self.urls.lock().await.push(url.to_string());
        let mut transports = self.transports.lock().await;
        if transports.is_empty() {
            return Err(SubmitError::Connection {
                message: format!("no transport available for {url}"),
            });
        }
        Ok(Box::new(transports.remove(0)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

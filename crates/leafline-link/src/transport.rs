//! Transport seam.
//!
//! A channel only ever talks to a [`Connector`] (opens transports) and the
//! [`Transport`] it yields (text frames in, text frames out). The production
//! implementation is a WebSocket; tests plug in an in-memory pair.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::LinkError;

/// An open, bidirectional text-frame transport.
pub trait Transport: Send + 'static {
    /// Write one text frame.
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Next inbound text frame; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<String, LinkError>>> + Send;

    /// Close the transport. Errors are swallowed.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports.
pub trait Connector: Send + Sync + 'static {
    /// Transport type produced.
    type Transport: Transport;

    /// Open a transport to `url`.
    fn connect(&self, url: &Url) -> impl Future<Output = Result<Self::Transport, LinkError>> + Send;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketConnector {
    /// Connector with a 10s open timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Override the open timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self, url: &Url) -> Result<WebSocketTransport, LinkError> {
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (ws, response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                LinkError::Transport(format!("connect timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|e| LinkError::Transport(format!("failed to connect: {e}")))?;

        debug!(url = %url, status = %response.status(), "websocket open");
        Ok(WebSocketTransport { ws })
    }
}

/// A WebSocket carrying JSON text frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), LinkError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LinkError::Transport(format!("send failed: {e}")))
    }

    async fn next_frame(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        return Some(Err(LinkError::MalformedFrame(
                            "binary frame is not UTF-8".to_string(),
                        )));
                    }
                },
                // tungstenite queues the pong; flushing sends it.
                Ok(Message::Ping(_)) => {
                    if let Err(e) = self.ws.flush().await {
                        return Some(Err(LinkError::Transport(format!("pong failed: {e}"))));
                    }
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "websocket closed by peer");
                    return None;
                }
                Err(e) => return Some(Err(LinkError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}

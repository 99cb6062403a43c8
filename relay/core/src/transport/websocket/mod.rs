//! WebSocket Transport
//!
//! Client connections to a remote assistant backend over `ws://` or `wss://`,
//! built on `tokio-tungstenite`. Each open spawns one reader task that turns
//! socket messages into [`TransportEvent`]s; the write half is the
//! connection's [`FrameSink`].
//!
//! Protocol-level ping/pong frames are answered by tungstenite itself and
//! never reach the connection manager; application heartbeats are JSON.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::traits::{Frame, FrameSink, Transport, TransportChannel, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound event buffer per connection
const EVENT_BUFFER: usize = 256;

/// How long a close handshake may take before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens WebSocket connections to one endpoint
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport for `url`
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    /// Endpoint this transport connects to
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportChannel, TransportError> {
        tracing::debug!(url = %self.url, "Opening WebSocket");

        let (stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (write, read) = stream.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(read_loop(read, event_tx));

        Ok(TransportChannel {
            sink: Box::new(WebSocketSink {
                write,
                closed: false,
            }),
            events: event_rx,
        })
    }

    fn describe(&self) -> String {
        format!("websocket {}", self.url)
    }
}

/// Forward socket messages until the socket or the receiver goes away
async fn read_loop(
    mut read: futures::stream::SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(result) = read.next().await {
        let event = match result {
            Ok(Message::Text(text)) => TransportEvent::Message(Frame::Text(text)),
            Ok(Message::Binary(bytes)) => TransportEvent::Message(Frame::Binary(bytes)),
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                let _ = events.send(TransportEvent::Closed { code, reason }).await;
                return;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                let _ = events
                    .send(TransportEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        if events.send(event).await.is_err() {
            // Manager dropped the connection
            return;
        }
    }

    let _ = events
        .send(TransportEvent::Closed {
            code: None,
            reason: "stream ended".to_string(),
        })
        .await;
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };

        self.write
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };

        match timeout(CLOSE_TIMEOUT, self.write.send(Message::Close(Some(frame)))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout(CLOSE_TIMEOUT)),
        }
    }
}

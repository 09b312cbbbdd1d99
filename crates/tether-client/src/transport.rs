//! Transport seam: the socket primitive the connection manager drives.
//!
//! The wire protocol itself lives behind [`Transport`]; the manager only
//! sees text frames. [`WsTransport`] is the production implementation on
//! tokio-tungstenite.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use tether_core::errors::{TransportError, TransportErrorKind};

/// Inbound event from an open link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A text frame carrying one JSON document.
    Text(String),
    /// The remote closed the link, or the stream ended.
    Closed,
    /// The link failed.
    Error(TransportError),
}

/// Write half of an open link.
#[async_trait]
pub trait LinkSink: Send {
    /// Transmit one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the link.
    async fn close(&mut self);
}

/// Read half of an open link.
#[async_trait]
pub trait LinkStream: Send {
    /// Wait for the next inbound event.
    async fn next_event(&mut self) -> LinkEvent;
}

/// An open link split into halves, ready for concurrent send and receive.
pub type SplitLink = (Box<dyn LinkSink>, Box<dyn LinkStream>);

/// Event-driven socket primitive supplying one link per connect call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<SplitLink, TransportError>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &str) -> Result<SplitLink, TransportError> {
        let (connection, _response) = connect_async(endpoint).await.map_err(|e| {
            TransportError::connect_failed(endpoint, e.to_string()).with_source(e)
        })?;
        let (sink, stream) = connection.split();
        Ok((
            Box::new(WsSink {
                endpoint: endpoint.to_owned(),
                sink,
            }),
            Box::new(WsStream {
                endpoint: endpoint.to_owned(),
                stream,
            }),
        ))
    }
}

struct WsSink {
    endpoint: String,
    sink: SplitSink<WsConnection, Message>,
}

#[async_trait]
impl LinkSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(text.into())).await.map_err(|e| {
            TransportError::new(&self.endpoint, TransportErrorKind::Send, e.to_string())
                .with_source(e)
        })
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    endpoint: String,
    stream: SplitStream<WsConnection>,
}

#[async_trait]
impl LinkStream for WsStream {
    async fn next_event(&mut self) -> LinkEvent {
        loop {
            match self.stream.next().await {
                None => return LinkEvent::Closed,
                Some(Ok(Message::Text(text))) => return LinkEvent::Text(text.to_string()),
                Some(Ok(Message::Binary(data))) => {
                    // Some peers deliver JSON in binary frames
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => return LinkEvent::Text(text),
                        Err(_) => {
                            debug!(endpoint = %self.endpoint, "ignoring non-UTF8 binary frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => return LinkEvent::Closed,
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return LinkEvent::Error(
                        TransportError::new(
                            &self.endpoint,
                            TransportErrorKind::Receive,
                            e.to_string(),
                        )
                        .with_source(e),
                    );
                }
            }
        }
    }
}

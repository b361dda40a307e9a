//! WebSocket transport implementation.
//!
//! This module provides the socket transport using tokio-tungstenite. The
//! `wss` variant needs the `tls` feature.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use herald_protocol::{Encoding, WireMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::catalog::TransportOptions;
use crate::traits::{Connection, Endpoint, Transport, TransportError};

/// WebSocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    name: &'static str,
    tls: bool,
    options: TransportOptions,
}

impl WebSocketTransport {
    /// Create a WebSocket transport with default options.
    #[must_use]
    pub fn new(name: &'static str, tls: bool) -> Self {
        Self::with_options(name, tls, TransportOptions::default())
    }

    /// Create a WebSocket transport.
    #[must_use]
    pub fn with_options(name: &'static str, tls: bool, options: TransportOptions) -> Self {
        Self { name, tls, options }
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        let url = endpoint.socket_url(self.tls);
        match self.options.encoding {
            Encoding::Json => url,
            Encoding::MessagePack => format!("{url}&format=msgpack"),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let url = self.url(endpoint);
        debug!(transport = self.name, %url, "Opening WebSocket");

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.options.max_message_size);

        let (stream, _response) = connect_async_with_config(url.as_str(), Some(config), true)
            .await
            .map_err(|e| match e {
                WsError::Io(io) => TransportError::Io(io),
                other => TransportError::Refused(format!("WebSocket handshake failed: {}", other)),
            })?;

        debug!(transport = self.name, "WebSocket handshake completed");

        Ok(Box::new(WebSocketConnection::new(
            stream,
            self.options.max_message_size,
            self.options.encoding,
        )))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: bool,
    max_message_size: usize,
    encoding: Encoding,
}

impl WebSocketConnection {
    fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        max_message_size: usize,
        encoding: Encoding,
    ) -> Self {
        Self {
            stream,
            is_open: true,
            max_message_size,
            encoding,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(WireMessage::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            herald_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }
                    return Ok(Some(WireMessage::Binary(Bytes::from(data))));
                }
                // tungstenite answers pings on its own
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection closed");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }
}

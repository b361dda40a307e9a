//! HTTP streaming and HTTP polling transports.
//!
//! Both transports share a session URL, `{base}/{session}`:
//!
//! - streaming: one long `GET {session}/xhr_streaming` whose body carries
//!   newline-delimited JSON frames as they happen;
//! - polling: repeated `GET {session}/xhr`, each body carrying the frames
//!   queued since the previous poll;
//! - both send with `POST {session}/xhr_send`, one frame per request.
//!
//! Reading happens on a background task feeding a channel so that
//! [`Connection::recv`] stays cancel-safe.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use herald_protocol::{codec, WireMessage};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::catalog::TransportOptions;
use crate::traits::{Connection, Endpoint, SessionId, Transport, TransportError};

type Inbound = Result<WireMessage, TransportError>;

/// Splits a byte stream into newline-delimited text frames.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete, non-blank line.
    fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let end = self.buf.iter().position(|b| *b == b'\n')?;
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            let text = match String::from_utf8(line.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    return Some(Err(TransportError::Protocol(
                        herald_protocol::ProtocolError::Invalid(e.to_string()),
                    )))
                }
            };
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(Ok(trimmed.to_string()));
            }
        }
    }

    /// Forward every complete line; `None` once the receiver is gone.
    fn drain(&mut self, tx: &mpsc::UnboundedSender<Inbound>) -> Option<usize> {
        let mut sent = 0;
        while let Some(line) = self.next_line() {
            tx.send(line.map(WireMessage::Text)).ok()?;
            sent += 1;
        }
        Some(sent)
    }
}

fn session_base(endpoint: &Endpoint, tls: bool) -> String {
    format!("{}/{}", endpoint.http_base(tls), SessionId::generate())
}

fn query(endpoint: &Endpoint) -> String {
    herald_protocol::PROTOCOL_VERSION.query(&endpoint.client_version)
}

fn http_client(options: &TransportOptions) -> Client {
    Client::builder()
        .connect_timeout(options.http_connect_timeout)
        .build()
        .unwrap_or_default()
}

async fn get(client: &Client, url: &str) -> Result<reqwest::Response, TransportError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TransportError::Refused(e.to_string()))?;
    if !response.status().is_success() {
        return Err(TransportError::Refused(format!(
            "GET {} returned {}",
            url,
            response.status()
        )));
    }
    Ok(response)
}

/// HTTP streaming transport.
#[derive(Debug, Clone)]
pub struct HttpStreamingTransport {
    name: &'static str,
    tls: bool,
    client: Client,
}

impl HttpStreamingTransport {
    /// Create a streaming transport with default options.
    #[must_use]
    pub fn new(name: &'static str, tls: bool) -> Self {
        Self::with_options(name, tls, &TransportOptions::default())
    }

    /// Create a streaming transport.
    #[must_use]
    pub fn with_options(name: &'static str, tls: bool, options: &TransportOptions) -> Self {
        Self {
            name,
            tls,
            client: http_client(options),
        }
    }
}

#[async_trait]
impl Transport for HttpStreamingTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let base = session_base(endpoint, self.tls);
        let url = format!("{}/xhr_streaming?{}", base, query(endpoint));
        debug!(transport = self.name, %url, "Opening HTTP stream");

        let response = get(&self.client, &url).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.name;

        let reader = tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        lines.push(&chunk);
                        if lines.drain(&tx).is_none() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(transport = name, error = %e, "HTTP stream failed");
                        let _ = tx.send(Err(TransportError::ReceiveFailed(e.to_string())));
                        return;
                    }
                }
            }
            debug!(transport = name, "HTTP stream ended");
        });

        Ok(Box::new(HttpConnection::new(self.client.clone(), base, rx, reader)))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// HTTP polling transport.
#[derive(Debug, Clone)]
pub struct HttpPollingTransport {
    name: &'static str,
    tls: bool,
    client: Client,
    poll_interval: Duration,
}

impl HttpPollingTransport {
    /// Create a polling transport with default options.
    #[must_use]
    pub fn new(name: &'static str, tls: bool) -> Self {
        Self::with_options(name, tls, &TransportOptions::default())
    }

    /// Create a polling transport.
    #[must_use]
    pub fn with_options(name: &'static str, tls: bool, options: &TransportOptions) -> Self {
        Self {
            name,
            tls,
            client: http_client(options),
            poll_interval: options.poll_interval,
        }
    }
}

#[async_trait]
impl Transport for HttpPollingTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let base = session_base(endpoint, self.tls);
        let url = format!("{}/xhr?{}", base, query(endpoint));
        debug!(transport = self.name, %url, "Opening HTTP polling session");

        // The first poll doubles as the open handshake.
        let first = get(&self.client, &url).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let name = self.name;
        let poll_interval = self.poll_interval;

        let reader = tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            let mut response = first;
            loop {
                match response.bytes().await {
                    Ok(body) => {
                        lines.push(&body);
                        lines.push(b"\n");
                        match lines.drain(&tx) {
                            None => return,
                            Some(0) => tokio::time::sleep(poll_interval).await,
                            Some(_) => {}
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(TransportError::ReceiveFailed(e.to_string())));
                        return;
                    }
                }

                trace!(transport = name, "Polling");
                response = match client.get(&url).send().await {
                    Ok(r) if r.status() == StatusCode::NOT_FOUND || r.status() == StatusCode::GONE => {
                        debug!(transport = name, "Polling session closed by service");
                        return;
                    }
                    Ok(r) if r.status().is_success() => r,
                    Ok(r) => {
                        let _ = tx.send(Err(TransportError::ReceiveFailed(format!(
                            "poll returned {}",
                            r.status()
                        ))));
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(TransportError::ReceiveFailed(e.to_string())));
                        return;
                    }
                };
            }
        });

        Ok(Box::new(HttpConnection::new(self.client.clone(), base, rx, reader)))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A connection over either HTTP transport.
pub struct HttpConnection {
    client: Client,
    send_url: String,
    rx: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
    is_open: bool,
}

impl HttpConnection {
    fn new(client: Client, base: String, rx: mpsc::UnboundedReceiver<Inbound>, reader: JoinHandle<()>) -> Self {
        Self {
            client,
            send_url: format!("{}/xhr_send", base),
            rx,
            reader,
            is_open: true,
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.is_open = false;
                Err(e)
            }
            None => {
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        let body = match message {
            WireMessage::Text(text) => text,
            WireMessage::Binary(data) => codec::encode_text(&codec::decode_binary(&data)?)?,
        };
        let response = self
            .client
            .post(&self.send_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!(
                "send returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        self.reader.abort();
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

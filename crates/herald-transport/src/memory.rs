//! In-process transport.
//!
//! Every successful [`MemoryTransport::open`] hands the service side of the
//! connection to the paired [`MemoryListener`], so tests can play the
//! service: accept, send handshake frames, read subscribe requests, drop the
//! connection to simulate a failure.

use async_trait::async_trait;
use herald_protocol::{codec, Frame, WireMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Connection, Endpoint, Transport, TransportError};

/// How the transport answers open requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Open and hand the service side to the listener.
    Accept,
    /// Fail immediately.
    Refuse,
    /// Never complete; only a timeout ends the attempt.
    Hang,
}

/// An in-memory transport. Clones share behavior and listener.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    name: &'static str,
    behavior: Arc<Mutex<Behavior>>,
    opens: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    /// Create a transport and the listener receiving its connections.
    #[must_use]
    pub fn new(name: &'static str) -> (Self, MemoryListener) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let transport = Self {
            name,
            behavior: Arc::new(Mutex::new(Behavior::Accept)),
            opens: Arc::new(AtomicUsize::new(0)),
            accepted,
        };
        (transport, MemoryListener { incoming })
    }

    /// Change how subsequent opens behave.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Number of open attempts so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap_or_else(PoisonError::into_inner);

        match behavior {
            Behavior::Refuse => Err(TransportError::Refused(format!("{} refused", self.name))),
            Behavior::Hang => std::future::pending::<Result<Box<dyn Connection>, TransportError>>().await,
            Behavior::Accept => {
                let (client_tx, server_rx) = mpsc::unbounded_channel();
                let (server_tx, client_rx) = mpsc::unbounded_channel();
                self.accepted
                    .send(MemoryPeer {
                        endpoint: endpoint.clone(),
                        tx: server_tx,
                        rx: server_rx,
                    })
                    .map_err(|_| TransportError::Refused(format!("{} has no listener", self.name)))?;
                trace!(transport = self.name, "Memory connection opened");
                Ok(Box::new(MemoryConnection {
                    tx: Some(client_tx),
                    rx: client_rx,
                }))
            }
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Client side of a memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Receives the service side of every accepted memory connection.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Service side of a memory connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: Endpoint,
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

impl MemoryPeer {
    /// Endpoint the client opened this connection to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a frame to the client as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the client side is gone.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = codec::encode_text(frame)?;
        self.send_raw(WireMessage::Text(text))
    }

    /// Send an arbitrary message, valid or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the client side is gone.
    pub fn send_raw(&self, message: WireMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next frame from the client.
    ///
    /// Returns `None` once the client closed the connection. Undecodable
    /// messages are skipped.
    pub async fn recv(&mut self) -> Option<Frame> {
        while let Some(message) = self.rx.recv().await {
            if let Ok(frame) = codec::decode(&message) {
                return Some(frame);
            }
        }
        None
    }

    /// Take a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        while let Ok(message) = self.rx.try_recv() {
            if let Ok(frame) = codec::decode(&message) {
                return Some(frame);
            }
        }
        None
    }

    /// Whether the client has dropped its side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//! Transport seam for managed streams.
//!
//! Stream management rides on an already-framed XML element stream. The
//! host provides the connection; this module defines the interface the core
//! needs and an in-memory implementation used by tests and the simulator.

use crate::error::TransportError;
use async_trait::async_trait;
use minidom::Element;
use tokio::sync::mpsc;
use tracing::trace;

/// Framed XML element stream
#[async_trait]
pub trait Transport: Send {
    /// Write one top-level element
    async fn send(&mut self, element: Element) -> Result<(), TransportError>;

    /// Read the next top-level element; `None` once the stream has closed
    async fn recv(&mut self) -> Result<Option<Element>, TransportError>;
}

/// One end of an in-process element stream
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Element>,
    rx: mpsc::UnboundedReceiver<Element>,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport { tx: a_tx, rx: a_rx },
            MemoryTransport { tx: b_tx, rx: b_rx },
        )
    }

    /// Whether the other end has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, element: Element) -> Result<(), TransportError> {
        trace!("memory transport send <{}/>", element.name());
        self.tx.send(element).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Element>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

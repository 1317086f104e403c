//! Listener primitive and the channel-backed listener fed by the HTTP ingress.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::Connection;

/// Why `accept` did not produce a connection.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener was closed cleanly; no more connections will arrive.
    #[error("listener stopped")]
    Stopped,
    /// A single accept failed; the listener is still usable.
    #[error("transient accept failure: {0}")]
    Transient(#[source] std::io::Error),
    /// The listener cannot accept any more connections.
    #[error("fatal accept failure: {0}")]
    Fatal(#[source] std::io::Error),
}

/// Source of inbound connections for the dispatcher.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, AcceptError>;
}

/// Creates a connected ingress sender / listener pair.
///
/// The listener reports [`AcceptError::Stopped`] once every sender is gone
/// and the queue is drained.
#[must_use]
pub fn ingress_channel(capacity: usize) -> (IngressSender, ChannelListener) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngressSender { tx }, ChannelListener { rx })
}

/// Sending half of the ingress queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<Box<dyn Connection>>,
}

impl IngressSender {
    /// Queues a connection for the dispatcher, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns the connection back when the listener has been dropped.
    pub async fn submit(&self, conn: Box<dyn Connection>) -> Result<(), Box<dyn Connection>> {
        self.tx.send(conn).await.map_err(|e| e.0)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Listener backed by the ingress queue.
#[derive(Debug)]
pub struct ChannelListener {
    rx: mpsc::Receiver<Box<dyn Connection>>,
}

#[async_trait]
impl Listener for ChannelListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, AcceptError> {
        self.rx.recv().await.ok_or(AcceptError::Stopped)
    }
}

//! Transport seam between the client driver and the network
//!
//! A `Connector` opens one message-oriented connection and hands back a pair
//! of channels. The driver never sees sockets, which lets tests swap in an
//! in-memory connector.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;

/// Frames the client asks the transport to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Send a close frame with this code and stop writing
    Close(u16),
}

/// Things the transport reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// Final event of a connection. Read errors and vanished peers are
    /// reported as code 1006.
    Closed { code: u16 },
}

/// An open connection: write side and read side
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Build a connection from the two channel halves the transport keeps
    /// the other ends of.
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Connection, TransportError>;
}

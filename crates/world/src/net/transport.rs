//! The message transport seam both network sessions are written against.

use std::fmt;

use super::stats::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    None,
    Connecting,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

/// A connection changed state. Delivered through [`Transport::run_callbacks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub connection: ConnectionHandle,
    pub old_state: TransportState,
    pub new_state: TransportState,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered once, in send order, or the connection fails.
    Reliable,
    /// May be dropped; never duplicated.
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub connection: ConnectionHandle,
    pub data: Vec<u8>,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub connection: ConnectionHandle,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection {0} does not exist")]
    UnknownConnection(ConnectionHandle),
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionHandle),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("no listener at the remote address")]
    ConnectionRefused,
    #[error("datagram codec failed: {0}")]
    Codec(String),
}

/// Connection-oriented message transport with reliable and unreliable
/// delivery. Callers drive it by polling once per tick; nothing happens
/// between calls.
pub trait Transport {
    /// Pumps the transport and reports every pending state change.
    fn run_callbacks(&mut self, handler: &mut dyn FnMut(StatusChange));

    /// Accepts an incoming connection that is in `Connecting`.
    fn accept(&mut self, connection: ConnectionHandle) -> Result<(), TransportError>;

    /// Takes at most `max` received messages; the rest stay queued.
    fn receive_messages(&mut self, max: usize) -> Vec<IncomingMessage>;

    /// Sends a batch, returning the messages that could not be queued.
    fn send_messages(
        &mut self,
        batch: Vec<OutgoingMessage>,
    ) -> Vec<(ConnectionHandle, TransportError)>;

    /// Largest message `send_messages` accepts.
    fn max_message_size(&self) -> usize;

    /// Closes the connection; the peer observes `ClosedByPeer`.
    fn close(&mut self, connection: ConnectionHandle, reason: &str);

    fn state(&self, connection: ConnectionHandle) -> TransportState;

    fn stats(&self) -> NetworkStats;
}

//! In-process transport: every endpoint shares one hub, messages move
//! between queues on send, and nothing is ever lost.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;

use super::stats::NetworkStats;
use super::transport::{
    ConnectionHandle, Delivery, IncomingMessage, OutgoingMessage, StatusChange, Transport,
    TransportError, TransportState,
};

type Route = (usize, ConnectionHandle);

#[derive(Debug, Default)]
struct Endpoint {
    status: VecDeque<StatusChange>,
    inbox: VecDeque<IncomingMessage>,
    states: HashMap<ConnectionHandle, TransportState>,
    stats: NetworkStats,
    refuse_sends: usize,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: Vec<Endpoint>,
    links: HashMap<Route, Route>,
    listener: Option<usize>,
    next_handle: u32,
    message_limit: Option<usize>,
}

impl Hub {
    fn add_endpoint(&mut self) -> usize {
        self.endpoints.push(Endpoint::default());
        self.endpoints.len() - 1
    }

    fn handle(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle(self.next_handle)
    }

    fn state(&self, (endpoint, handle): Route) -> TransportState {
        self.endpoints[endpoint]
            .states
            .get(&handle)
            .copied()
            .unwrap_or(TransportState::None)
    }

    fn set_state(&mut self, (endpoint, handle): Route, new_state: TransportState, detail: &str) {
        let ep = &mut self.endpoints[endpoint];
        let old_state = ep
            .states
            .insert(handle, new_state)
            .unwrap_or(TransportState::None);
        if old_state != new_state {
            ep.status.push_back(StatusChange {
                connection: handle,
                old_state,
                new_state,
                detail: detail.to_string(),
            });
        }
    }

    fn forget(&mut self, (endpoint, handle): Route) {
        let ep = &mut self.endpoints[endpoint];
        ep.states.remove(&handle);
        ep.inbox.retain(|message| message.connection != handle);
    }
}

/// Factory for connected [`LoopbackTransport`] pairs.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`LoopbackNetwork::new`], but refuses messages over `limit` bytes
    /// the way a datagram transport does.
    pub fn with_message_limit(limit: usize) -> Self {
        let network = Self::default();
        network.hub.borrow_mut().message_limit = Some(limit);
        network
    }

    /// Creates the endpoint that incoming connections arrive at.
    pub fn listen(&self) -> LoopbackTransport {
        let mut hub = self.hub.borrow_mut();
        let endpoint = hub.add_endpoint();
        hub.listener = Some(endpoint);
        LoopbackTransport {
            hub: Rc::clone(&self.hub),
            endpoint,
        }
    }

    /// Opens a connection to the listener. The returned handle starts in
    /// `Connecting` until the listener accepts it.
    pub fn connect(&self) -> Result<(LoopbackTransport, ConnectionHandle), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let listener = hub.listener.ok_or(TransportError::ConnectionRefused)?;

        let endpoint = hub.add_endpoint();
        let local = (endpoint, hub.handle());
        let remote = (listener, hub.handle());
        hub.links.insert(local, remote);
        hub.links.insert(remote, local);
        hub.set_state(local, TransportState::Connecting, "connecting");
        hub.set_state(remote, TransportState::Connecting, "incoming connection");

        let transport = LoopbackTransport {
            hub: Rc::clone(&self.hub),
            endpoint,
        };
        Ok((transport, local.1))
    }
}

#[derive(Debug)]
pub struct LoopbackTransport {
    hub: Rc<RefCell<Hub>>,
    endpoint: usize,
}

impl LoopbackTransport {
    /// Fails a connection as if the link had dropped: both sides observe
    /// `ProblemDetectedLocally`.
    pub fn simulate_problem(&mut self, connection: ConnectionHandle, detail: &str) {
        let mut hub = self.hub.borrow_mut();
        let local = (self.endpoint, connection);
        if let Some(remote) = hub.links.remove(&local) {
            hub.links.remove(&remote);
            hub.set_state(remote, TransportState::ProblemDetectedLocally, detail);
        }
        hub.set_state(local, TransportState::ProblemDetectedLocally, detail);
    }

    /// Makes the next `count` outgoing messages fail as if the send buffer
    /// were full.
    pub fn refuse_sends(&mut self, count: usize) {
        self.hub.borrow_mut().endpoints[self.endpoint].refuse_sends = count;
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        let hub = self.hub.borrow();
        let mut handles: Vec<_> = hub.endpoints[self.endpoint].states.keys().copied().collect();
        handles.sort();
        handles
    }
}

impl Transport for LoopbackTransport {
    fn run_callbacks(&mut self, handler: &mut dyn FnMut(StatusChange)) {
        let changes: Vec<StatusChange> = {
            let mut hub = self.hub.borrow_mut();
            hub.endpoints[self.endpoint].status.drain(..).collect()
        };
        for change in changes {
            handler(change);
        }
    }

    fn accept(&mut self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let local = (self.endpoint, connection);
        let remote = *hub
            .links
            .get(&local)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if hub.state(local) != TransportState::Connecting {
            return Err(TransportError::NotConnected(connection));
        }
        hub.set_state(local, TransportState::Connected, "accepted");
        hub.set_state(remote, TransportState::Connected, "accepted by peer");
        Ok(())
    }

    fn receive_messages(&mut self, max: usize) -> Vec<IncomingMessage> {
        let mut hub = self.hub.borrow_mut();
        let endpoint = &mut hub.endpoints[self.endpoint];
        let count = max.min(endpoint.inbox.len());
        let messages: Vec<_> = endpoint.inbox.drain(..count).collect();
        endpoint.stats.messages_received += messages.len() as u64;
        endpoint.stats.bytes_received += messages.iter().map(|m| m.data.len() as u64).sum::<u64>();
        messages
    }

    fn send_messages(
        &mut self,
        batch: Vec<OutgoingMessage>,
    ) -> Vec<(ConnectionHandle, TransportError)> {
        let mut hub = self.hub.borrow_mut();
        let mut failures = Vec::new();

        for message in batch {
            let local = (self.endpoint, message.connection);
            let Some(&remote) = hub.links.get(&local) else {
                failures.push((message.connection, TransportError::UnknownConnection(message.connection)));
                continue;
            };
            if hub.state(local) != TransportState::Connected
                || hub.state(remote) != TransportState::Connected
            {
                failures.push((message.connection, TransportError::NotConnected(message.connection)));
                continue;
            }
            if let Some(limit) = hub.message_limit.filter(|&limit| message.data.len() > limit) {
                failures.push((
                    message.connection,
                    TransportError::MessageTooLarge {
                        size: message.data.len(),
                        limit,
                    },
                ));
                continue;
            }
            let sender = &mut hub.endpoints[self.endpoint];
            if sender.refuse_sends > 0 {
                sender.refuse_sends -= 1;
                failures.push((
                    message.connection,
                    TransportError::Io(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "send buffer full",
                    )),
                ));
                continue;
            }

            let size = message.data.len() as u64;
            let sender = &mut hub.endpoints[self.endpoint].stats;
            sender.messages_sent += 1;
            sender.packets_sent += 1;
            sender.bytes_sent += size;
            if message.delivery == Delivery::Unreliable {
                log::trace!("Loopback delivers unreliable message on {}", message.connection);
            }

            let receiver = &mut hub.endpoints[remote.0];
            receiver.stats.packets_received += 1;
            receiver.inbox.push_back(IncomingMessage {
                connection: remote.1,
                data: message.data,
            });
        }
        failures
    }

    fn max_message_size(&self) -> usize {
        self.hub.borrow().message_limit.unwrap_or(usize::MAX)
    }

    fn close(&mut self, connection: ConnectionHandle, reason: &str) {
        let mut hub = self.hub.borrow_mut();
        let local = (self.endpoint, connection);
        if let Some(remote) = hub.links.remove(&local) {
            hub.links.remove(&remote);
            if matches!(
                hub.state(remote),
                TransportState::Connecting | TransportState::Connected
            ) {
                hub.set_state(remote, TransportState::ClosedByPeer, reason);
            }
        }
        hub.forget(local);
    }

    fn state(&self, connection: ConnectionHandle) -> TransportState {
        self.hub.borrow().state((self.endpoint, connection))
    }

    fn stats(&self) -> NetworkStats {
        self.hub.borrow().endpoints[self.endpoint].stats
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        for connection in self.connections() {
            self.close(connection, "endpoint dropped");
        }
        let mut hub = self.hub.borrow_mut();
        if hub.listener == Some(self.endpoint) {
            hub.listener = None;
        }
    }
}

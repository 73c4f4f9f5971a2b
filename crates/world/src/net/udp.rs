//! [`Transport`] over a non-blocking UDP socket.
//!
//! Connections open with a salted challenge handshake. Every datagram carries
//! a sequence number and a piggybacked ack bitfield; reliable messages ride
//! in the same datagrams with their own ids and are resent until the peer's
//! cumulative ack covers them.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use super::protocol::{PROTOCOL_MAGIC, PROTOCOL_VERSION};
use super::stats::{NetworkStats, rand_u64};
use super::tracking::{AckTracker, ReceiveTracker, ReliableReceiver, ReliableSender};
use super::transport::{
    ConnectionHandle, Delivery, IncomingMessage, OutgoingMessage, StatusChange, Transport,
    TransportError, TransportState,
};

pub const MAX_PACKET_SIZE: usize = 65_000;
/// Largest single message; leaves room for the datagram envelope.
pub const MAX_MESSAGE_SIZE: usize = MAX_PACKET_SIZE - 512;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_RESEND: Duration = Duration::from_millis(250);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const MIN_RTO_MS: f32 = 50.0;
const SEGMENT_OVERHEAD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
struct DatagramHeader {
    magic: u32,
    version: u32,
    sequence: u32,
    ack: u32,
    ack_bitfield: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
enum Segment {
    Reliable { id: u32, data: Vec<u8> },
    Unreliable { data: Vec<u8> },
}

impl Segment {
    fn wire_size(&self) -> usize {
        match self {
            Segment::Reliable { data, .. } | Segment::Unreliable { data } => {
                data.len() + SEGMENT_OVERHEAD
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
enum DatagramBody {
    ConnectRequest { client_salt: u64 },
    Challenge { server_salt: u64 },
    ChallengeResponse { combined_salt: u64 },
    Accepted,
    Denied { reason: String },
    Payload { reliable_ack: u32, segments: Vec<Segment> },
    KeepAlive { reliable_ack: u32 },
    Disconnect { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
struct Datagram {
    header: DatagramHeader,
    body: DatagramBody,
}

impl Datagram {
    fn encode(&self) -> Result<Vec<u8>, TransportError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn decode(data: &[u8]) -> Result<Self, TransportError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    state: TransportState,
    client_salt: u64,
    server_salt: u64,
    /// Server: challenge sent. Client: challenge received.
    challenged: bool,
    send_sequence: u32,
    acks: AckTracker,
    received: ReceiveTracker,
    sender: ReliableSender,
    receiver: ReliableReceiver,
    outbox: Vec<Segment>,
    ack_pending: bool,
    created: Instant,
    last_receive: Instant,
    last_send: Instant,
}

impl Peer {
    fn new(addr: SocketAddr, client_salt: u64, server_salt: u64) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: TransportState::Connecting,
            client_salt,
            server_salt,
            challenged: false,
            send_sequence: 0,
            acks: AckTracker::new(256),
            received: ReceiveTracker::new(),
            sender: ReliableSender::new(),
            receiver: ReliableReceiver::default(),
            outbox: Vec::new(),
            ack_pending: false,
            created: now,
            last_receive: now,
            last_send: now,
        }
    }

    fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            TransportState::Connecting | TransportState::Connected
        )
    }
}

fn transmit(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    body: DatagramBody,
) -> Result<usize, TransportError> {
    let sequence = peer.send_sequence;
    peer.send_sequence = peer.send_sequence.wrapping_add(1);
    let (ack, ack_bitfield) = peer.received.ack_data();
    let datagram = Datagram {
        header: DatagramHeader {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        },
        body,
    };

    let data = datagram.encode()?;
    if data.len() > MAX_PACKET_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: data.len(),
            limit: MAX_PACKET_SIZE,
        });
    }
    let bytes = socket.send_to(&data, peer.addr)?;

    peer.acks.track(sequence);
    peer.last_send = Instant::now();
    peer.ack_pending = false;
    stats.packets_sent += 1;
    stats.bytes_sent += bytes as u64;
    Ok(bytes)
}

/// Packs segments into as few payload datagrams as fit.
fn transmit_segments(
    socket: &UdpSocket,
    stats: &mut NetworkStats,
    peer: &mut Peer,
    segments: Vec<Segment>,
) -> Result<(), TransportError> {
    let mut batch = Vec::new();
    let mut size = 0;
    for segment in segments {
        let segment_size = segment.wire_size();
        if !batch.is_empty() && size + segment_size > MAX_MESSAGE_SIZE {
            let reliable_ack = peer.receiver.ack();
            transmit(socket, stats, peer, DatagramBody::Payload {
                reliable_ack,
                segments: std::mem::take(&mut batch),
            })?;
            size = 0;
        }
        size += segment_size;
        batch.push(segment);
    }
    if !batch.is_empty() {
        let reliable_ack = peer.receiver.ack();
        transmit(socket, stats, peer, DatagramBody::Payload {
            reliable_ack,
            segments: batch,
        })?;
    }
    Ok(())
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    role: Role,
    peers: HashMap<ConnectionHandle, Peer>,
    by_addr: HashMap<SocketAddr, ConnectionHandle>,
    next_handle: u32,
    status: VecDeque<StatusChange>,
    inbox: VecDeque<IncomingMessage>,
    stats: NetworkStats,
    recv_buffer: Vec<u8>,
    timeout: Duration,
}

impl UdpTransport {
    fn bind<A: ToSocketAddrs>(addr: A, role: Role) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            role,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_handle: 0,
            status: VecDeque::new(),
            inbox: VecDeque::new(),
            stats: NetworkStats::default(),
            recv_buffer: vec![0u8; MAX_PACKET_SIZE],
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Binds a listening socket; incoming connections show up as
    /// `Connecting` status changes.
    pub fn listen<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let transport = Self::bind(addr, Role::Server)?;
        log::info!("Listening on {}", transport.local_addr);
        Ok(transport)
    }

    /// Starts connecting to `server` from an ephemeral local port.
    pub fn connect<A: ToSocketAddrs>(
        server: A,
    ) -> Result<(Self, ConnectionHandle), TransportError> {
        let remote = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no server address"))?;
        let local: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let mut transport = Self::bind(local, Role::Client)?;
        let handle = transport.add_peer(Peer::new(remote, rand_u64(), 0));
        transport.push_status(handle, TransportState::None, TransportState::Connecting, "connecting");
        transport.send_handshake(handle)?;
        log::info!("Connecting to {remote} from {}", transport.local_addr);
        Ok((transport, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn peer_addr(&self, connection: ConnectionHandle) -> Option<SocketAddr> {
        self.peers.get(&connection).map(|peer| peer.addr)
    }

    fn add_peer(&mut self, peer: Peer) -> ConnectionHandle {
        self.next_handle += 1;
        let handle = ConnectionHandle(self.next_handle);
        self.by_addr.insert(peer.addr, handle);
        self.peers.insert(handle, peer);
        handle
    }

    fn push_status(
        &mut self,
        connection: ConnectionHandle,
        old_state: TransportState,
        new_state: TransportState,
        detail: &str,
    ) {
        self.status.push_back(StatusChange {
            connection,
            old_state,
            new_state,
            detail: detail.to_string(),
        });
    }

    fn set_state(&mut self, connection: ConnectionHandle, new_state: TransportState, detail: &str) {
        let Some(peer) = self.peers.get_mut(&connection) else {
            return;
        };
        let old_state = peer.state;
        if old_state == new_state {
            return;
        }
        peer.state = new_state;
        self.push_status(connection, old_state, new_state, detail);
    }

    fn send_body(
        &mut self,
        connection: ConnectionHandle,
        body: DatagramBody,
    ) -> Result<usize, TransportError> {
        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        transmit(&self.socket, &mut self.stats, peer, body)
    }

    /// Sends whichever handshake datagram the connection is waiting on.
    fn send_handshake(&mut self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let Some(peer) = self.peers.get(&connection) else {
            return Err(TransportError::UnknownConnection(connection));
        };
        let body = match (self.role, peer.challenged) {
            (Role::Client, false) => DatagramBody::ConnectRequest {
                client_salt: peer.client_salt,
            },
            (Role::Client, true) => DatagramBody::ChallengeResponse {
                combined_salt: peer.combined_salt(),
            },
            (Role::Server, true) => DatagramBody::Challenge {
                server_salt: peer.server_salt,
            },
            (Role::Server, false) => return Ok(()),
        };
        self.send_body(connection, body)?;
        Ok(())
    }

    fn pump(&mut self) {
        self.receive_datagrams();
        self.maintain();
    }

    fn receive_datagrams(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    let datagram = match Datagram::decode(&self.recv_buffer[..size]) {
                        Ok(datagram) => datagram,
                        Err(e) => {
                            log::debug!("Dropping undecodable datagram from {addr}: {e}");
                            continue;
                        }
                    };
                    if datagram.header.magic != PROTOCOL_MAGIC
                        || datagram.header.version != PROTOCOL_VERSION
                    {
                        log::debug!("Dropping datagram from {addr} with foreign header");
                        continue;
                    }
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    self.handle_datagram(addr, datagram);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::warn!("Socket receive failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, datagram: Datagram) {
        let Some(&handle) = self.by_addr.get(&addr) else {
            if let (Role::Server, DatagramBody::ConnectRequest { client_salt }) =
                (self.role, &datagram.body)
            {
                let mut peer = Peer::new(addr, *client_salt, rand_u64());
                peer.received.record(datagram.header.sequence);
                let handle = self.add_peer(peer);
                log::debug!("Incoming connection {handle} from {addr}");
                self.push_status(
                    handle,
                    TransportState::None,
                    TransportState::Connecting,
                    &format!("incoming connection from {addr}"),
                );
            }
            return;
        };

        let Some(peer) = self.peers.get_mut(&handle) else {
            return;
        };
        if !peer.is_open() {
            return;
        }
        if !peer.received.record(datagram.header.sequence) {
            return;
        }
        peer.acks
            .process_ack(datagram.header.ack, datagram.header.ack_bitfield);
        peer.last_receive = Instant::now();
        self.stats.rtt_ms = peer.acks.srtt();
        self.stats.rtt_variance = peer.acks.rtt_var();

        let result = match datagram.body {
            DatagramBody::ConnectRequest { .. } => self.send_handshake(handle),
            DatagramBody::Challenge { server_salt } => self.on_challenge(handle, server_salt),
            DatagramBody::ChallengeResponse { combined_salt } => {
                self.on_challenge_response(handle, combined_salt)
            }
            DatagramBody::Accepted => {
                if self.role == Role::Client {
                    self.set_state(handle, TransportState::Connected, "accepted by server");
                }
                Ok(())
            }
            DatagramBody::Denied { reason } => {
                self.set_state(handle, TransportState::ClosedByPeer, &reason);
                Ok(())
            }
            DatagramBody::Payload {
                reliable_ack,
                segments,
            } => {
                self.on_payload(handle, reliable_ack, segments);
                Ok(())
            }
            DatagramBody::KeepAlive { reliable_ack } => {
                if let Some(peer) = self.peers.get_mut(&handle) {
                    peer.sender.acknowledge(reliable_ack);
                }
                Ok(())
            }
            DatagramBody::Disconnect { reason } => {
                self.set_state(handle, TransportState::ClosedByPeer, &reason);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("Handshake reply to {addr} failed: {e}");
        }
    }

    fn on_challenge(&mut self, handle: ConnectionHandle, server_salt: u64) -> Result<(), TransportError> {
        if self.role != Role::Client {
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&handle) else {
            return Ok(());
        };
        if peer.state != TransportState::Connecting {
            return Ok(());
        }
        peer.server_salt = server_salt;
        peer.challenged = true;
        self.send_handshake(handle)
    }

    fn on_challenge_response(
        &mut self,
        handle: ConnectionHandle,
        combined_salt: u64,
    ) -> Result<(), TransportError> {
        if self.role != Role::Server {
            return Ok(());
        }
        let Some(peer) = self.peers.get(&handle) else {
            return Ok(());
        };
        if !peer.challenged || peer.combined_salt() != combined_salt {
            log::warn!("Connection {handle} answered the challenge incorrectly");
            return Ok(());
        }
        if peer.state == TransportState::Connecting {
            self.set_state(handle, TransportState::Connected, "handshake complete");
        }
        self.send_body(handle, DatagramBody::Accepted)?;
        Ok(())
    }

    fn on_payload(&mut self, handle: ConnectionHandle, reliable_ack: u32, segments: Vec<Segment>) {
        // Payload before Accepted means the acceptance datagram was lost.
        let implicitly_accepted = self.role == Role::Client
            && self
                .peers
                .get(&handle)
                .is_some_and(|peer| peer.challenged && peer.state == TransportState::Connecting);
        if implicitly_accepted {
            self.set_state(handle, TransportState::Connected, "accepted by server");
        }

        let Some(peer) = self.peers.get_mut(&handle) else {
            return;
        };
        if peer.state != TransportState::Connected {
            return;
        }
        peer.sender.acknowledge(reliable_ack);

        for segment in segments {
            match segment {
                Segment::Unreliable { data } => {
                    self.inbox.push_back(IncomingMessage {
                        connection: handle,
                        data,
                    });
                }
                Segment::Reliable { id, data } => {
                    peer.ack_pending = true;
                    for data in peer.receiver.receive(id, data) {
                        self.inbox.push_back(IncomingMessage {
                            connection: handle,
                            data,
                        });
                    }
                }
            }
        }
    }

    /// Resends, keepalives and timeouts.
    fn maintain(&mut self) {
        let now = Instant::now();
        let mut failed = Vec::new();
        let mut handshakes = Vec::new();

        for (&handle, peer) in &mut self.peers {
            match peer.state {
                TransportState::Connecting => {
                    if now.duration_since(peer.created) > self.timeout {
                        failed.push((handle, "connection attempt timed out"));
                    } else if now.duration_since(peer.last_send) >= HANDSHAKE_RESEND {
                        handshakes.push(handle);
                    }
                }
                TransportState::Connected => {
                    if now.duration_since(peer.last_receive) > self.timeout {
                        failed.push((handle, "connection timed out"));
                        continue;
                    }

                    let rto = Duration::from_secs_f32(peer.acks.rto_ms(MIN_RTO_MS) / 1000.0);
                    let resend: Vec<Segment> = peer
                        .sender
                        .due(now, rto)
                        .into_iter()
                        .map(|(id, data)| Segment::Reliable { id, data })
                        .collect();
                    if !resend.is_empty() {
                        self.stats.packets_resent += 1;
                        if let Err(e) = transmit_segments(&self.socket, &mut self.stats, peer, resend) {
                            log::warn!("Resend to {} failed: {e}", peer.addr);
                        }
                    }

                    if peer.ack_pending || now.duration_since(peer.last_send) >= KEEPALIVE_INTERVAL {
                        let reliable_ack = peer.receiver.ack();
                        if let Err(e) = transmit(
                            &self.socket,
                            &mut self.stats,
                            peer,
                            DatagramBody::KeepAlive { reliable_ack },
                        ) {
                            log::warn!("Keepalive to {} failed: {e}", peer.addr);
                        }
                    }
                }
                _ => {}
            }
        }

        for handle in handshakes {
            if let Err(e) = self.send_handshake(handle) {
                log::warn!("Handshake resend on {handle} failed: {e}");
            }
        }
        for (handle, detail) in failed {
            log::info!("Connection {handle}: {detail}");
            self.set_state(handle, TransportState::ProblemDetectedLocally, detail);
        }
    }
}

impl Transport for UdpTransport {
    fn run_callbacks(&mut self, handler: &mut dyn FnMut(StatusChange)) {
        self.pump();
        while let Some(change) = self.status.pop_front() {
            handler(change);
        }
    }

    fn accept(&mut self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if self.role != Role::Server || peer.state != TransportState::Connecting || peer.challenged {
            return Err(TransportError::NotConnected(connection));
        }
        peer.challenged = true;
        self.send_handshake(connection)
    }

    fn receive_messages(&mut self, max: usize) -> Vec<IncomingMessage> {
        let count = max.min(self.inbox.len());
        let messages: Vec<_> = self.inbox.drain(..count).collect();
        self.stats.messages_received += messages.len() as u64;
        messages
    }

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    fn send_messages(
        &mut self,
        batch: Vec<OutgoingMessage>,
    ) -> Vec<(ConnectionHandle, TransportError)> {
        let mut failures = Vec::new();
        let mut touched = Vec::new();

        for message in batch {
            let connection = message.connection;
            let Some(peer) = self.peers.get_mut(&connection) else {
                failures.push((connection, TransportError::UnknownConnection(connection)));
                continue;
            };
            if peer.state != TransportState::Connected {
                failures.push((connection, TransportError::NotConnected(connection)));
                continue;
            }
            if message.data.len() > MAX_MESSAGE_SIZE {
                failures.push((
                    connection,
                    TransportError::MessageTooLarge {
                        size: message.data.len(),
                        limit: MAX_MESSAGE_SIZE,
                    },
                ));
                continue;
            }

            let segment = match message.delivery {
                Delivery::Reliable => Segment::Reliable {
                    id: peer.sender.queue(&message.data),
                    data: message.data,
                },
                Delivery::Unreliable => Segment::Unreliable { data: message.data },
            };
            peer.outbox.push(segment);
            self.stats.messages_sent += 1;
            if !touched.contains(&connection) {
                touched.push(connection);
            }
        }

        for connection in touched {
            let Some(peer) = self.peers.get_mut(&connection) else {
                continue;
            };
            let segments = std::mem::take(&mut peer.outbox);
            if let Err(e) = transmit_segments(&self.socket, &mut self.stats, peer, segments) {
                log::warn!("Send on {connection} failed, will retry reliable data: {e}");
            }
        }
        failures
    }

    fn close(&mut self, connection: ConnectionHandle, reason: &str) {
        let Some(mut peer) = self.peers.remove(&connection) else {
            return;
        };
        self.by_addr.remove(&peer.addr);
        self.inbox.retain(|message| message.connection != connection);

        if peer.is_open() {
            let body = match (self.role, peer.state) {
                (Role::Server, TransportState::Connecting) => DatagramBody::Denied {
                    reason: reason.to_string(),
                },
                _ => DatagramBody::Disconnect {
                    reason: reason.to_string(),
                },
            };
            if let Err(e) = transmit(&self.socket, &mut self.stats, &mut peer, body) {
                log::debug!("Disconnect notice to {} failed: {e}", peer.addr);
            }
        }
    }

    fn state(&self, connection: ConnectionHandle) -> TransportState {
        self.peers
            .get(&connection)
            .map_or(TransportState::None, |peer| peer.state)
    }

    fn stats(&self) -> NetworkStats {
        self.stats
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let handles: Vec<_> = self.peers.keys().copied().collect();
        for handle in handles {
            self.close(handle, "transport shut down");
        }
    }
}

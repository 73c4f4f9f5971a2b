pub mod client;
pub mod loopback;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tracking;
pub mod transport;
pub mod udp;

pub use client::{NetworkClient, SessionState};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use protocol::{
    ALL_CLIENTS, AvatarType, ClientEvent, ClientId, ComponentBatch, DEFAULT_PORT,
    DEFAULT_TICK_RATE, FIRST_CLIENT_ID, JoinRejectReason, JoinRequest, NO_CLIENT,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, ProtocolError, ScriptUpdate, ServerEvent, WorldEvent, pack_world_updates,
};
pub use server::{ClientRecord, ClientState, NetworkServer, SessionEvent, validate_checksums};
pub use stats::NetworkStats;
pub use transport::{
    ConnectionHandle, Delivery, IncomingMessage, OutgoingMessage, StatusChange, Transport,
    TransportError, TransportState,
};
pub use udp::{MAX_MESSAGE_SIZE, MAX_PACKET_SIZE, UdpTransport};

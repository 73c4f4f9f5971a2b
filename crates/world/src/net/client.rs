//! Client side of a network session: the join request, applying world
//! updates and streaming the local avatar.

use super::protocol::{
    AvatarType, ClientEvent, ClientId, JoinRejectReason, JoinRequest, NO_CLIENT, ProtocolError,
    ServerEvent,
};
use super::stats::NetworkStats;
use super::transport::{
    ConnectionHandle, Delivery, OutgoingMessage, StatusChange, Transport, TransportState,
};
use crate::avatar::Avatar;
use crate::config::SessionConfig;
use crate::content::LumpChecksum;
use crate::world::{World, hierarchy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Transport is up but the server has not assigned us an id.
    Connected,
    Joined,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Joined => "joined",
        }
    }
}

pub struct NetworkClient<T: Transport> {
    transport: T,
    connection: Option<ConnectionHandle>,
    state: SessionState,
    client_id: ClientId,
    username: String,
    avatar_type: Option<AvatarType>,
    checksums: Vec<LumpChecksum>,
    config: SessionConfig,
    outbox: Vec<OutgoingMessage>,
    announcements: Vec<String>,
    rejection: Option<JoinRejectReason>,
    updates_applied: u64,
}

impl<T: Transport> NetworkClient<T> {
    /// Wraps a transport that has started connecting on `connection`.
    pub fn connect(
        transport: T,
        connection: ConnectionHandle,
        username: impl Into<String>,
        avatar_type: Option<AvatarType>,
        checksums: Vec<LumpChecksum>,
        config: SessionConfig,
    ) -> Self {
        let username = username.into();
        log::info!("Connecting as {username:?} on {connection}");
        Self {
            transport,
            connection: Some(connection),
            state: SessionState::Connecting,
            client_id: NO_CLIENT,
            username,
            avatar_type,
            checksums,
            config,
            outbox: Vec::new(),
            announcements: Vec::new(),
            rejection: None,
            updates_applied: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }

    /// [`NO_CLIENT`] until the server assigns an id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Why the server refused the last join request, if it did.
    pub fn rejection(&self) -> Option<JoinRejectReason> {
        self.rejection
    }

    pub fn announcements(&self) -> &[String] {
        &self.announcements
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    pub fn stats(&self) -> NetworkStats {
        self.transport.stats()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One session tick: connection callbacks, inbound server events, the
    /// avatar update, then a single batched send.
    pub fn update(&mut self, world: &mut World, avatar: Option<&dyn Avatar>) {
        let mut changes = Vec::new();
        self.transport
            .run_callbacks(&mut |change| changes.push(change));
        for change in changes {
            self.handle_status(change);
        }

        let Some(connection) = self.connection else {
            return;
        };

        let messages = self
            .transport
            .receive_messages(self.config.max_messages_per_tick);
        for message in messages {
            if message.connection != connection {
                continue;
            }
            match ServerEvent::decode(&message.data) {
                Ok(event) => self.handle_server_event(world, event),
                Err(ProtocolError::VersionMismatch { expected, received }) => {
                    log::error!(
                        "Server speaks protocol version {received}, we speak {expected}"
                    );
                    self.rejection = Some(JoinRejectReason::VersionMismatch {
                        expected: received,
                        received: expected,
                    });
                }
                Err(e) => log::error!("Dropping server message: {e}"),
            }
        }

        if self.state == SessionState::Joined {
            if let Some(avatar) = avatar {
                self.queue_avatar(avatar);
            }
        }
        self.flush();
    }

    fn handle_status(&mut self, change: StatusChange) {
        if Some(change.connection) != self.connection {
            return;
        }
        match change.new_state {
            TransportState::Connected => {
                if self.state == SessionState::Connecting {
                    log::info!("Connected, requesting to join");
                    self.state = SessionState::Connected;
                    self.send_join_request();
                }
            }
            TransportState::ClosedByPeer | TransportState::ProblemDetectedLocally => {
                log::warn!("Connection lost: {}", change.detail);
                if let Some(connection) = self.connection {
                    self.transport.close(connection, &change.detail);
                }
                self.reset();
            }
            TransportState::Connecting | TransportState::None => {}
        }
    }

    /// Asks the server to let us in. Sent automatically on connect; call it
    /// again to retry after a rejection.
    pub fn send_join_request(&mut self) {
        let request = ClientEvent::JoinRequest(JoinRequest {
            username: self.username.clone(),
            avatar_type: self.avatar_type,
            lump_checksums: self.checksums.clone(),
        });
        if let Err(e) = self.send_event(&request, Delivery::Reliable) {
            log::error!("Failed to encode join request: {e}");
        }
    }

    fn handle_server_event(&mut self, world: &mut World, event: ServerEvent) {
        match event {
            ServerEvent::Announcement { message } => {
                log::info!("Server: {message}");
                self.announcements.push(message);
            }
            ServerEvent::AssignClientId { new_id } => {
                log::info!("Joined as client {new_id}");
                self.client_id = new_id;
                self.state = SessionState::Joined;
                self.rejection = None;
            }
            ServerEvent::WorldUpdate { events } => {
                if self.state != SessionState::Joined {
                    log::debug!("Ignoring world update before join");
                    return;
                }
                for event in &events {
                    world.process_event(event);
                }
                hierarchy::update_world_transforms(world.registry_mut());
                self.updates_applied += 1;
            }
            ServerEvent::JoinRejected { reason } => {
                log::warn!("Server rejected join: {reason}");
                self.rejection = Some(reason);
            }
        }
    }

    fn queue_avatar(&mut self, avatar: &dyn Avatar) {
        let bytes = match avatar.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to serialize avatar: {e}");
                return;
            }
        };
        let update = ClientEvent::AvatarUpdate { avatar: bytes };
        if let Err(e) = self.send_event(&update, Delivery::Unreliable) {
            log::error!("Failed to encode avatar update: {e}");
        }
    }

    /// Queues `event` for the server; it leaves with the next flush.
    pub fn send_event(&mut self, event: &ClientEvent, delivery: Delivery) -> Result<(), ProtocolError> {
        let Some(connection) = self.connection else {
            return Ok(());
        };
        self.outbox.push(OutgoingMessage {
            connection,
            data: event.encode()?,
            delivery,
        });
        Ok(())
    }

    pub fn flush(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.outbox);
        for (connection, error) in self.transport.send_messages(batch) {
            log::warn!("Send on connection {connection} failed: {error}");
        }
    }

    pub fn disconnect(&mut self) {
        self.flush();
        if let Some(connection) = self.connection {
            log::info!("Disconnecting from server");
            self.transport.close(connection, "client disconnected");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.connection = None;
        self.client_id = NO_CLIENT;
        self.outbox.clear();
    }
}

impl<T: Transport> Drop for NetworkClient<T> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.transport.close(connection, "client shutting down");
        }
    }
}

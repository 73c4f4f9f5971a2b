//! Server side of a network session: connection bookkeeping, the join gate,
//! world broadcasts and avatar input.

use std::collections::{HashMap, VecDeque};

use super::protocol::{
    ALL_CLIENTS, ClientEvent, ClientId, FIRST_CLIENT_ID, JoinRejectReason, JoinRequest,
    ProtocolError, ServerEvent, WorldEvent, pack_world_updates,
};
use super::stats::NetworkStats;
use super::transport::{
    ConnectionHandle, Delivery, OutgoingMessage, StatusChange, Transport, TransportState,
};
use crate::avatar::{Avatar, create_avatar};
use crate::config::{BroadcastPolicy, SessionConfig};
use crate::content::LumpChecksum;
use crate::world::{World, WorldEventSorter};

/// Events per `WorldUpdate` message; larger updates are split.
const WORLD_UPDATE_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Joined,
    /// Join was refused; the connection stays open and may ask again.
    Rejected,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Joined => "joined",
            ClientState::Rejected => "rejected",
        }
    }
}

pub struct ClientRecord {
    id: ClientId,
    connection: ConnectionHandle,
    state: ClientState,
    username: String,
    avatar: Option<Box<dyn Avatar>>,
    needs_snapshot: bool,
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("username", &self.username)
            .field("avatar", &self.avatar.as_ref().map(|a| a.avatar_type()))
            .finish()
    }
}

impl ClientRecord {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn avatar_entities(&self) -> &[crate::world::EntityId] {
        match &self.avatar {
            Some(avatar) => avatar.entities(),
            None => &[],
        }
    }
}

/// Things the host may want to display or react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ClientConnecting {
        connection: ConnectionHandle,
    },
    ClientConnected {
        client_id: ClientId,
    },
    ClientJoined {
        client_id: ClientId,
        username: String,
    },
    JoinRejected {
        client_id: ClientId,
        reason: JoinRejectReason,
    },
    ClientDisconnected {
        client_id: ClientId,
        detail: String,
    },
    ProtocolViolation {
        client_id: ClientId,
        message: String,
    },
}

/// Order-sensitive comparison of the client's lump checksums against ours.
pub fn validate_checksums(
    server: &[LumpChecksum],
    client: &[LumpChecksum],
) -> Result<(), JoinRejectReason> {
    if server.len() != client.len() {
        return Err(JoinRejectReason::ChecksumCountMismatch {
            expected: server.len() as u32,
            received: client.len() as u32,
        });
    }
    match server.iter().zip(client).position(|(ours, theirs)| ours != theirs) {
        Some(index) => Err(JoinRejectReason::ChecksumMismatch {
            index: index as u32,
        }),
        None => Ok(()),
    }
}

pub struct NetworkServer<T: Transport> {
    transport: T,
    config: SessionConfig,
    checksums: Vec<LumpChecksum>,
    clients: HashMap<ClientId, ClientRecord>,
    connections: HashMap<ConnectionHandle, ClientId>,
    next_client_id: ClientId,
    outbox: Vec<OutgoingMessage>,
    events: VecDeque<SessionEvent>,
    tick: u64,
}

impl<T: Transport> NetworkServer<T> {
    pub fn new(transport: T, checksums: Vec<LumpChecksum>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            checksums,
            clients: HashMap::new(),
            connections: HashMap::new(),
            next_client_id: FIRST_CLIENT_ID,
            outbox: Vec::new(),
            events: VecDeque::new(),
            tick: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    pub fn client(&self, client_id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&client_id)
    }

    pub fn joined_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ClientState::Joined)
            .count()
    }

    pub fn stats(&self) -> NetworkStats {
        self.transport.stats()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// One session tick: connection callbacks, a bounded batch of inbound
    /// messages, the world broadcast, then a single batched send.
    pub fn update(&mut self, world: &mut World, sorter: &mut WorldEventSorter) {
        self.tick += 1;

        let mut changes = Vec::new();
        self.transport
            .run_callbacks(&mut |change| changes.push(change));
        for change in changes {
            self.handle_status(world, sorter, change);
        }

        let messages = self
            .transport
            .receive_messages(self.config.max_messages_per_tick);
        for message in messages {
            let Some(&client_id) = self.connections.get(&message.connection) else {
                log::debug!("Dropping message from unknown connection {}", message.connection);
                continue;
            };
            match ClientEvent::decode(&message.data) {
                Ok(event) => self.handle_client_event(world, sorter, client_id, event),
                Err(e) => self.handle_decode_error(client_id, e),
            }
        }

        self.broadcast(world, sorter);
        self.flush();
    }

    fn handle_status(
        &mut self,
        world: &mut World,
        sorter: &mut WorldEventSorter,
        change: StatusChange,
    ) {
        let connection = change.connection;
        match change.new_state {
            TransportState::Connecting => {
                if self.connections.contains_key(&connection) {
                    return;
                }
                let client_id = self.next_client_id;
                self.next_client_id += 1;
                self.connections.insert(connection, client_id);
                self.clients.insert(
                    client_id,
                    ClientRecord {
                        id: client_id,
                        connection,
                        state: ClientState::Connecting,
                        username: String::new(),
                        avatar: None,
                        needs_snapshot: false,
                    },
                );
                log::info!("Connection {connection} incoming ({})", change.detail);
                self.events
                    .push_back(SessionEvent::ClientConnecting { connection });

                if let Err(e) = self.transport.accept(connection) {
                    log::warn!("Failed to accept connection {connection}: {e}");
                    self.disconnect(world, sorter, connection, "accept failed");
                }
            }
            TransportState::Connected => {
                let Some(client) = self
                    .connections
                    .get(&connection)
                    .and_then(|id| self.clients.get_mut(id))
                else {
                    return;
                };
                if client.state == ClientState::Connecting {
                    client.state = ClientState::Connected;
                    log::info!("Client {} connected on {connection}", client.id);
                    self.events
                        .push_back(SessionEvent::ClientConnected { client_id: client.id });
                }
            }
            TransportState::ClosedByPeer | TransportState::ProblemDetectedLocally => {
                log::warn!("Connection {connection} lost: {}", change.detail);
                self.disconnect(world, sorter, connection, &change.detail);
            }
            TransportState::None => {}
        }
    }

    fn handle_decode_error(&mut self, client_id: ClientId, error: ProtocolError) {
        log::error!("Dropping message from client {client_id}: {error}");
        if let ProtocolError::VersionMismatch { expected, received } = error {
            let unjoined = self
                .clients
                .get(&client_id)
                .is_some_and(|c| c.state != ClientState::Joined);
            if unjoined {
                self.reject(client_id, JoinRejectReason::VersionMismatch { expected, received });
                return;
            }
        }
        self.events.push_back(SessionEvent::ProtocolViolation {
            client_id,
            message: error.to_string(),
        });
    }

    fn handle_client_event(
        &mut self,
        world: &mut World,
        sorter: &mut WorldEventSorter,
        client_id: ClientId,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::JoinRequest(request) => self.handle_join(world, sorter, client_id, request),
            ClientEvent::AvatarUpdate { avatar: bytes } => {
                let Some(client) = self.clients.get_mut(&client_id) else {
                    return;
                };
                if client.state != ClientState::Joined {
                    log::debug!("Ignoring avatar update from unjoined client {client_id}");
                    return;
                }
                let Some(avatar) = client.avatar.as_mut() else {
                    log::debug!("Client {client_id} sent an avatar update without an avatar");
                    return;
                };
                let result = avatar
                    .deserialize(&bytes)
                    .and_then(|()| avatar.sync_world(world));
                if let Err(e) = result {
                    log::error!("Bad avatar update from client {client_id}: {e}");
                    self.events.push_back(SessionEvent::ProtocolViolation {
                        client_id,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn handle_join(
        &mut self,
        world: &mut World,
        sorter: &mut WorldEventSorter,
        client_id: ClientId,
        request: JoinRequest,
    ) {
        let joined = self.joined_count();
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        match client.state {
            ClientState::Connected | ClientState::Rejected => {}
            ClientState::Joined => {
                log::warn!("Client {client_id} sent a second join request");
                return;
            }
            ClientState::Connecting => {
                log::warn!("Client {client_id} asked to join before connecting");
                return;
            }
        }

        let verdict = validate_checksums(&self.checksums, &request.lump_checksums).and_then(|()| {
            if joined >= self.config.max_clients {
                Err(JoinRejectReason::ServerFull)
            } else {
                Ok(())
            }
        });
        if let Err(reason) = verdict {
            log::warn!(
                "Rejecting join of {:?} (client {client_id}): {reason}",
                request.username
            );
            self.reject(client_id, reason);
            return;
        }

        client.state = ClientState::Joined;
        client.username = request.username;
        client.needs_snapshot = true;

        if let Some(avatar_type) = request.avatar_type {
            let mut avatar = create_avatar(avatar_type);
            match avatar.attach(world) {
                Ok(entities) => {
                    sorter.process_events(
                        entities
                            .into_iter()
                            .map(|new_id| WorldEvent::SpawnEntity { new_id }),
                    );
                    client.avatar = Some(avatar);
                }
                Err(e) => log::warn!("Failed to attach avatar for client {client_id}: {e}"),
            }
        }

        let username = client.username.clone();
        log::info!("Client {client_id} joined as {username:?}");
        self.queue(client_id, &ServerEvent::AssignClientId { new_id: client_id }, Delivery::Reliable);
        self.queue(
            client_id,
            &ServerEvent::Announcement {
                message: format!("Welcome, {username}!"),
            },
            Delivery::Reliable,
        );
        self.events
            .push_back(SessionEvent::ClientJoined { client_id, username });
    }

    fn reject(&mut self, client_id: ClientId, reason: JoinRejectReason) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.state = ClientState::Rejected;
        }
        self.queue(client_id, &ServerEvent::JoinRejected { reason }, Delivery::Reliable);
        self.events
            .push_back(SessionEvent::JoinRejected { client_id, reason });
    }

    /// Sends the pending delta to joined clients and a full snapshot to
    /// clients that joined since the last broadcast.
    fn broadcast(&mut self, world: &mut World, sorter: &mut WorldEventSorter) {
        let send_delta = match self.config.broadcast {
            BroadcastPolicy::EveryTick => true,
            BroadcastPolicy::WhenChanged => sorter.has_pending_changes(world),
        };

        let delta = send_delta.then(|| sorter.broadcast_global_events(world));
        let mut snapshot = None;

        let joined: Vec<(ClientId, bool)> = self
            .clients
            .values_mut()
            .filter(|c| c.state == ClientState::Joined)
            .map(|c| (c.id, std::mem::take(&mut c.needs_snapshot)))
            .collect();

        for (client_id, needs_snapshot) in joined {
            let events = if needs_snapshot {
                &*snapshot.get_or_insert_with(|| sorter.full_snapshot(world))
            } else if let Some(delta) = &delta {
                delta
            } else {
                continue;
            };
            self.queue_world_update(client_id, events);
        }

        if send_delta {
            sorter.finish_broadcast(world);
        }
    }

    fn queue_world_update(&mut self, client_id: ClientId, events: &[WorldEvent]) {
        let limit = self.transport.max_message_size();
        for chunk in pack_world_updates(events, limit, WORLD_UPDATE_CHUNK) {
            let update = ServerEvent::WorldUpdate { events: chunk };
            self.queue(client_id, &update, Delivery::Reliable);
        }
    }

    fn queue(&mut self, client_id: ClientId, event: &ServerEvent, delivery: Delivery) {
        if let Err(e) = self.send_event(event, client_id, delivery) {
            log::error!("Failed to encode server event for client {client_id}: {e}");
        }
    }

    /// Queues `event` for `destination`, or for every joined client when it is
    /// [`ALL_CLIENTS`]. Nothing leaves until [`NetworkServer::flush`].
    pub fn send_event(
        &mut self,
        event: &ServerEvent,
        destination: ClientId,
        delivery: Delivery,
    ) -> Result<(), ProtocolError> {
        let data = event.encode()?;
        if destination == ALL_CLIENTS {
            for client in self.clients.values() {
                if client.state == ClientState::Joined {
                    self.outbox.push(OutgoingMessage {
                        connection: client.connection,
                        data: data.clone(),
                        delivery,
                    });
                }
            }
        } else if let Some(client) = self.clients.get(&destination) {
            self.outbox.push(OutgoingMessage {
                connection: client.connection,
                data,
                delivery,
            });
        } else {
            log::debug!("Dropping event for unknown client {destination}");
        }
        Ok(())
    }

    /// Hands everything queued this tick to the transport in one batch.
    ///
    /// A joined client that misses part of a world update is scheduled for a
    /// full snapshot, since the dirty flags it depended on are already gone.
    pub fn flush(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.outbox);
        for (connection, error) in self.transport.send_messages(batch) {
            log::warn!("Send on connection {connection} failed: {error}");
            let Some(client) = self
                .connections
                .get(&connection)
                .and_then(|id| self.clients.get_mut(id))
            else {
                continue;
            };
            if client.state == ClientState::Joined && !client.needs_snapshot {
                log::warn!("Client {} will be resynchronized with a full snapshot", client.id);
                client.needs_snapshot = true;
            }
        }
    }

    fn disconnect(
        &mut self,
        world: &mut World,
        sorter: &mut WorldEventSorter,
        connection: ConnectionHandle,
        detail: &str,
    ) {
        self.transport.close(connection, detail);
        let Some(client_id) = self.connections.remove(&connection) else {
            return;
        };
        let Some(mut client) = self.clients.remove(&client_id) else {
            return;
        };
        if let Some(mut avatar) = client.avatar.take() {
            let destroyed = avatar.detach(world);
            sorter.process_events(
                destroyed
                    .into_iter()
                    .map(|id| WorldEvent::DestroyEntity { id }),
            );
        }
        log::info!("Client {client_id} disconnected: {detail}");
        self.events.push_back(SessionEvent::ClientDisconnected {
            client_id,
            detail: detail.to_string(),
        });
    }

    /// Drops a client from the session and closes its connection.
    pub fn kick(
        &mut self,
        world: &mut World,
        sorter: &mut WorldEventSorter,
        client_id: ClientId,
        reason: &str,
    ) {
        if let Some(connection) = self.clients.get(&client_id).map(|c| c.connection) {
            self.disconnect(world, sorter, connection, reason);
        }
    }

    /// Closes every connection, removing avatars from `world`.
    pub fn shutdown(&mut self, world: &mut World, sorter: &mut WorldEventSorter) {
        self.flush();
        let connections: Vec<_> = self.connections.keys().copied().collect();
        for connection in connections {
            self.disconnect(world, sorter, connection, "server shutting down");
        }
    }
}

impl<T: Transport> Drop for NetworkServer<T> {
    fn drop(&mut self) {
        for &connection in self.connections.keys() {
            self.transport.close(connection, "server shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_gate_is_order_sensitive() {
        let server = [0xA, 0xB, 0xC];
        assert_eq!(validate_checksums(&server, &[0xA, 0xB, 0xC]), Ok(()));
        assert_eq!(
            validate_checksums(&server, &[0xA, 0xB]),
            Err(JoinRejectReason::ChecksumCountMismatch {
                expected: 3,
                received: 2
            })
        );
        assert_eq!(
            validate_checksums(&server, &[0xA, 0xC, 0xB]),
            Err(JoinRejectReason::ChecksumMismatch { index: 1 })
        );
        assert_eq!(
            validate_checksums(&server, &[0xA, 0xB, 0xD]),
            Err(JoinRejectReason::ChecksumMismatch { index: 2 })
        );
        assert_eq!(validate_checksums(&[], &[]), Ok(()));
    }
}

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};

use skein::component::Transform;
use skein::config::SessionConfig;
use skein::content::StaticContent;
use skein::net::{
    ConnectionHandle, Delivery, NetworkClient, NetworkServer, OutgoingMessage, SessionState,
    StatusChange, Transport, TransportState, UdpTransport, WorldEvent,
};
use skein::world::{World, WorldEventSorter};

/// Polls `step` every millisecond until it returns true or `timeout_ms` runs out.
fn wait_until(timeout_ms: u64, mut step: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if step() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn drain(transport: &mut UdpTransport) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    transport.run_callbacks(&mut |change| changes.push(change));
    changes
}

fn connected_pair() -> (UdpTransport, ConnectionHandle, UdpTransport, ConnectionHandle) {
    let mut server = UdpTransport::listen("127.0.0.1:0").unwrap();
    let (mut client, client_side) = UdpTransport::connect(server.local_addr()).unwrap();

    let mut server_side = None;
    let mut server_up = false;
    let mut client_up = false;
    let connected = wait_until(2000, || {
        for change in drain(&mut server) {
            match change.new_state {
                TransportState::Connecting => {
                    server.accept(change.connection).unwrap();
                    server_side = Some(change.connection);
                }
                TransportState::Connected => server_up = true,
                _ => {}
            }
        }
        client_up |= drain(&mut client)
            .iter()
            .any(|c| c.new_state == TransportState::Connected);
        server_up && client_up
    });
    assert!(connected, "handshake did not complete");

    (server, server_side.unwrap(), client, client_side)
}

#[test]
fn test_udp_handshake_and_reliable_ordering() {
    let (mut server, server_side, mut client, client_side) = connected_pair();
    assert_eq!(server.state(server_side), TransportState::Connected);
    assert_eq!(client.state(client_side), TransportState::Connected);
    assert_eq!(server.peer_addr(server_side).unwrap().port(), client.local_addr().port());

    let batch: Vec<OutgoingMessage> = (0u32..50)
        .map(|i| OutgoingMessage {
            connection: client_side,
            data: i.to_le_bytes().to_vec(),
            delivery: Delivery::Reliable,
        })
        .collect();
    assert!(client.send_messages(batch).is_empty());

    let mut received = Vec::new();
    let complete = wait_until(2000, || {
        drain(&mut client);
        drain(&mut server);
        received.extend(server.receive_messages(16));
        received.len() >= 50
    });
    assert!(complete, "only {} messages arrived", received.len());

    for (i, message) in received.iter().enumerate() {
        assert_eq!(message.connection, server_side);
        assert_eq!(message.data, (i as u32).to_le_bytes());
    }
    assert!(server.stats().packets_received > 0);
}

#[test]
fn test_udp_oversized_message_is_refused() {
    let (_server, _server_side, mut client, client_side) = connected_pair();
    let failures = client.send_messages(vec![OutgoingMessage {
        connection: client_side,
        data: vec![0; skein::net::MAX_MESSAGE_SIZE + 1],
        delivery: Delivery::Unreliable,
    }]);
    assert_eq!(failures.len(), 1);
}

#[test]
fn test_udp_close_reaches_peer() {
    let (mut server, server_side, mut client, client_side) = connected_pair();
    client.close(client_side, "bye");
    assert_eq!(client.state(client_side), TransportState::None);

    let mut detail = None;
    let closed = wait_until(2000, || {
        for change in drain(&mut server) {
            if change.connection == server_side && change.new_state == TransportState::ClosedByPeer {
                detail = Some(change.detail);
            }
        }
        detail.is_some()
    });
    assert!(closed);
    assert_eq!(detail.as_deref(), Some("bye"));
}

#[test]
fn test_udp_silent_server_times_out() {
    // Bound but never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let (mut client, handle) = UdpTransport::connect(silent.local_addr().unwrap()).unwrap();
    client.set_timeout(Duration::from_millis(200));

    let failed = wait_until(3000, || {
        drain(&mut client)
            .iter()
            .any(|c| c.connection == handle && c.new_state == TransportState::ProblemDetectedLocally)
    });
    assert!(failed);
}

#[test]
fn test_udp_session_replicates_world() {
    let content = Arc::new(StaticContent::empty());
    let config = SessionConfig::default();

    let transport = UdpTransport::listen("127.0.0.1:0").unwrap();
    let server_addr = transport.local_addr();
    let mut server = NetworkServer::new(transport, Vec::new(), config.clone());
    let mut server_world = World::new(content.clone());
    let mut sorter = WorldEventSorter::new(config.dirty);

    let (transport, handle) = UdpTransport::connect(server_addr).unwrap();
    let mut client = NetworkClient::connect(transport, handle, "udp", None, Vec::new(), config);
    let mut client_world = World::new(content);

    let joined = wait_until(3000, || {
        server.update(&mut server_world, &mut sorter);
        client.update(&mut client_world, None);
        client.state() == SessionState::Joined
    });
    assert!(joined, "client stuck in {:?}", client.state());

    let entity = server_world.create_entity();
    server_world
        .registry_mut()
        .emplace(entity, Transform::new(Vec3::new(3.0, 2.0, 1.0), Quat::IDENTITY))
        .unwrap();
    sorter.process_event(WorldEvent::SpawnEntity { new_id: entity });

    let replicated = wait_until(3000, || {
        server.update(&mut server_world, &mut sorter);
        client.update(&mut client_world, None);
        client_world.registry().has::<Transform>(entity)
    });
    assert!(replicated);
    assert_eq!(
        client_world
            .registry()
            .get::<Transform>(entity)
            .unwrap()
            .position(),
        Vec3::new(3.0, 2.0, 1.0)
    );

    client.disconnect();
    let left = wait_until(3000, || {
        server.update(&mut server_world, &mut sorter);
        server.joined_count() == 0
    });
    assert!(left);
}

#[test]
fn test_udp_late_joiner_receives_large_world() {
    const ENTITIES: usize = 3000;
    let content = Arc::new(StaticContent::empty());
    let config = SessionConfig::default();

    let transport = UdpTransport::listen("127.0.0.1:0").unwrap();
    let server_addr = transport.local_addr();
    let mut server = NetworkServer::new(transport, Vec::new(), config.clone());
    let mut server_world = World::new(content.clone());
    let mut sorter = WorldEventSorter::new(config.dirty);

    let entities: Vec<u32> = (0..ENTITIES)
        .map(|i| {
            let entity = server_world.create_entity();
            server_world
                .registry_mut()
                .emplace(entity, Transform::new(Vec3::new(i as f32, 1.0, 0.0), Quat::IDENTITY))
                .unwrap();
            sorter.process_event(WorldEvent::SpawnEntity { new_id: entity });
            entity
        })
        .collect();
    server.update(&mut server_world, &mut sorter);
    assert!(!sorter.has_pending_changes(&server_world));

    let (transport, handle) = UdpTransport::connect(server_addr).unwrap();
    let mut client = NetworkClient::connect(transport, handle, "late", None, Vec::new(), config);
    let mut client_world = World::new(content);

    let replicated = wait_until(10_000, || {
        server.update(&mut server_world, &mut sorter);
        client.update(&mut client_world, None);
        client_world.registry().count::<Transform>() == ENTITIES
    });
    assert!(
        replicated,
        "only {} of {ENTITIES} transforms arrived",
        client_world.registry().count::<Transform>()
    );
    assert_eq!(client.state(), SessionState::Joined);
    for (i, &entity) in entities.iter().enumerate() {
        let position = client_world
            .registry()
            .get::<Transform>(entity)
            .unwrap()
            .position();
        assert_eq!(position, Vec3::new(i as f32, 1.0, 0.0));
    }
}

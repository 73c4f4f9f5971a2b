use std::sync::Arc;

use glam::{Quat, Vec3};

use skein::avatar::{Avatar, SpectatorAvatar};
use skein::component::{MeshRenderer, PointLight, Relationship, SynchronizedComponent, Transform};
use skein::config::{BroadcastPolicy, SessionConfig};
use skein::content::{ContentManifest, LumpChecksum, StaticContent};
use skein::net::{
    AvatarType, ClientEvent, Delivery, FIRST_CLIENT_ID, JoinRejectReason, LoopbackNetwork,
    LoopbackTransport, NO_CLIENT, NetworkClient, NetworkServer, SessionEvent, SessionState,
    WorldEvent,
};
use skein::world::{World, WorldEventSorter};

const MESH: u32 = 0x4c8d_6924;
const MATERIAL: u32 = 0x9541_4060;
const A: LumpChecksum = 0xAAAA_0001;
const B: LumpChecksum = 0xBBBB_0002;
const C: LumpChecksum = 0xCCCC_0003;
const D: LumpChecksum = 0xDDDD_0004;

fn content() -> Arc<StaticContent> {
    let manifest = ContentManifest::from_toml_str(&format!(
        r#"
        assets = [{MESH}, {MATERIAL}]

        [[lumps]]
        name = "a"
        checksum = {A}

        [[lumps]]
        name = "b"
        checksum = {B}

        [[lumps]]
        name = "c"
        checksum = {C}
        "#
    ))
    .unwrap();
    Arc::new(StaticContent::new(manifest))
}

struct Peer {
    session: NetworkClient<LoopbackTransport>,
    world: World,
    avatar: Option<SpectatorAvatar>,
}

impl Peer {
    fn update(&mut self) {
        let avatar = self.avatar.as_ref().map(|a| a as &dyn Avatar);
        self.session.update(&mut self.world, avatar);
    }
}

struct Harness {
    network: LoopbackNetwork,
    world: World,
    sorter: WorldEventSorter,
    server: NetworkServer<LoopbackTransport>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> Self {
        Self::on_network(LoopbackNetwork::new(), config)
    }

    fn on_network(network: LoopbackNetwork, config: SessionConfig) -> Self {
        let transport = network.listen();
        let sorter = WorldEventSorter::new(config.dirty);
        Self {
            world: World::new(content()),
            server: NetworkServer::new(transport, vec![A, B, C], config),
            sorter,
            network,
        }
    }

    fn connect(&self, username: &str, checksums: &[LumpChecksum], avatar: bool) -> Peer {
        let (transport, handle) = self.network.connect().unwrap();
        let avatar_type = avatar.then_some(AvatarType::Spectator);
        Peer {
            session: NetworkClient::connect(
                transport,
                handle,
                username,
                avatar_type,
                checksums.to_vec(),
                SessionConfig::default(),
            ),
            world: World::new(content()),
            avatar: avatar.then(SpectatorAvatar::new),
        }
    }

    fn tick(&mut self) {
        self.server.update(&mut self.world, &mut self.sorter);
    }

    /// Alternates server and client ticks.
    fn pump(&mut self, peers: &mut [&mut Peer], rounds: usize) {
        for _ in 0..rounds {
            self.tick();
            for peer in peers.iter_mut() {
                peer.update();
            }
        }
    }

    fn spawn(&mut self, position: Vec3) -> u32 {
        let entity = self.world.create_entity();
        self.world
            .registry_mut()
            .emplace(entity, Transform::new(position, Quat::IDENTITY))
            .unwrap();
        self.sorter
            .process_event(WorldEvent::SpawnEntity { new_id: entity });
        entity
    }
}

#[test]
fn test_join_gate_compares_checksums_in_order() {
    let mut harness = Harness::new();
    let mut exact = harness.connect("exact", &[A, B, C], false);
    let mut short = harness.connect("short", &[A, B], false);
    let mut swapped = harness.connect("swapped", &[A, C, B], false);
    let mut changed = harness.connect("changed", &[A, B, D], false);

    harness.pump(&mut [&mut exact, &mut short, &mut swapped, &mut changed], 4);

    assert_eq!(exact.session.state(), SessionState::Joined);
    assert_eq!(exact.session.client_id(), FIRST_CLIENT_ID);
    assert!(exact.session.rejection().is_none());
    assert!(exact.session.announcements()[0].contains("exact"));

    for (peer, reason) in [
        (
            &short,
            JoinRejectReason::ChecksumCountMismatch {
                expected: 3,
                received: 2,
            },
        ),
        (&swapped, JoinRejectReason::ChecksumMismatch { index: 1 }),
        (&changed, JoinRejectReason::ChecksumMismatch { index: 2 }),
    ] {
        assert_eq!(peer.session.state(), SessionState::Connected);
        assert_eq!(peer.session.client_id(), NO_CLIENT);
        assert_eq!(peer.session.rejection(), Some(reason));
        assert!(peer.session.connection().is_some());
    }

    assert_eq!(harness.server.joined_count(), 1);
    let rejected = harness
        .server
        .drain_events()
        .filter(|e| matches!(e, SessionEvent::JoinRejected { .. }))
        .count();
    assert_eq!(rejected, 3);
}

#[test]
fn test_full_server_rejects_join() {
    let mut harness = Harness::with_config(SessionConfig {
        max_clients: 1,
        ..SessionConfig::default()
    });
    let mut first = harness.connect("first", &[A, B, C], false);
    let mut second = harness.connect("second", &[A, B, C], false);
    harness.pump(&mut [&mut first, &mut second], 4);

    assert!(first.session.is_joined());
    assert_eq!(
        second.session.rejection(),
        Some(JoinRejectReason::ServerFull)
    );
}

#[test]
fn test_component_batches_arrive_byte_equal() {
    let mut harness = Harness::new();
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let entity = harness.spawn(Vec3::new(1.0, 2.0, 3.0));
    let registry = harness.world.registry_mut();
    registry
        .emplace(entity, PointLight::new(Vec3::ZERO, Vec3::new(0.5, 0.5, 1.0)))
        .unwrap();
    registry
        .emplace(entity, MeshRenderer::new(MESH, MATERIAL))
        .unwrap();
    harness.pump(&mut [&mut peer], 2);

    let server = harness.world.registry();
    let client = peer.world.registry();
    assert_eq!(
        bytemuck::bytes_of(&server.get::<Transform>(entity).unwrap().data()),
        bytemuck::bytes_of(&client.get::<Transform>(entity).unwrap().data())
    );
    assert_eq!(
        bytemuck::bytes_of(&server.get::<PointLight>(entity).unwrap().data()),
        bytemuck::bytes_of(&client.get::<PointLight>(entity).unwrap().data())
    );
    let renderer = client.get::<MeshRenderer>(entity).unwrap();
    assert_eq!(renderer.mesh(), MESH);
    assert!(renderer.is_resolved());
    assert!(!client.get::<Transform>(entity).unwrap().is_dirty());

    harness
        .world
        .registry_mut()
        .get_mut::<Transform>(entity)
        .unwrap()
        .set_position(Vec3::new(-4.0, 0.0, 0.5));
    harness.pump(&mut [&mut peer], 2);
    assert_eq!(
        peer.world
            .registry()
            .get::<Transform>(entity)
            .unwrap()
            .position(),
        Vec3::new(-4.0, 0.0, 0.5)
    );
}

#[test]
fn test_late_joiner_receives_snapshot_with_hierarchy() {
    let mut harness = Harness::new();
    let root = harness.spawn(Vec3::new(1.0, 0.0, 0.0));
    let child = harness.spawn(Vec3::new(0.0, 1.0, 0.0));
    harness.world.adopt(root, child).unwrap();

    // Nobody is listening yet; this broadcast only clears the dirty flags.
    harness.tick();
    assert!(!harness.sorter.has_pending_changes(&harness.world));

    let mut peer = harness.connect("late", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let registry = peer.world.registry();
    assert!(registry.valid(root));
    assert!(registry.valid(child));
    assert_eq!(registry.get::<Relationship>(child).unwrap().parent(), root);
    assert_eq!(peer.world.children(root), vec![child]);

    let position = peer.world.world_transform(child).unwrap().w_axis.truncate();
    assert!(position.abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-5));
}

#[test]
fn test_deep_chain_replicates_composed_transform() {
    let mut harness = Harness::new();
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let locals = [
        (Vec3::new(1.0, 0.0, 0.0), Quat::from_rotation_z(std::f32::consts::FRAC_PI_2)),
        (Vec3::new(0.0, 2.0, 0.0), Quat::IDENTITY),
        (Vec3::new(0.0, 0.0, 3.0), Quat::from_rotation_y(std::f32::consts::FRAC_PI_2)),
        (Vec3::new(4.0, 0.0, 0.0), Quat::IDENTITY),
        (Vec3::new(0.0, 5.0, 0.0), Quat::IDENTITY),
    ];
    let mut chain = vec![0; locals.len()];
    for depth in (0..locals.len()).rev() {
        let (position, rotation) = locals[depth];
        let entity = harness.spawn(position);
        harness
            .world
            .registry_mut()
            .get_mut::<Transform>(entity)
            .unwrap()
            .set_orientation(rotation);
        chain[depth] = entity;
    }
    for depth in [2, 0, 3, 1] {
        harness.world.adopt(chain[depth], chain[depth + 1]).unwrap();
    }
    harness.world.update(0.0);
    harness.pump(&mut [&mut peer], 2);

    let expected = Vec3::new(-6.0, 0.0, -1.0);
    let leaf = chain[locals.len() - 1];
    let on_server = harness.world.world_transform(leaf).unwrap().w_axis.truncate();
    assert!(on_server.abs_diff_eq(expected, 1e-4));

    for depth in 0..locals.len() - 1 {
        assert_eq!(peer.world.children(chain[depth]), vec![chain[depth + 1]]);
    }
    let on_client = peer.world.world_transform(leaf).unwrap().w_axis.truncate();
    assert!(on_client.abs_diff_eq(expected, 1e-4));
}

#[test]
fn test_large_world_is_split_under_message_limit() {
    const LIMIT: usize = 4096;
    const ENTITIES: usize = 1500;
    let mut harness =
        Harness::on_network(LoopbackNetwork::with_message_limit(LIMIT), SessionConfig::default());
    let entities: Vec<u32> = (0..ENTITIES)
        .map(|i| harness.spawn(Vec3::new(i as f32, 0.5, -(i as f32))))
        .collect();
    harness.tick();
    assert!(!harness.sorter.has_pending_changes(&harness.world));

    let mut peer = harness.connect("late", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let registry = peer.world.registry();
    assert_eq!(registry.count::<Transform>(), ENTITIES);
    for (i, &entity) in entities.iter().enumerate() {
        let position = registry.get::<Transform>(entity).unwrap().position();
        assert_eq!(position, Vec3::new(i as f32, 0.5, -(i as f32)));
    }
}

#[test]
fn test_refused_update_is_repaired_by_snapshot() {
    let mut harness = Harness::new();
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let entity = harness.spawn(Vec3::new(3.0, 2.0, 1.0));
    harness.server.transport_mut().refuse_sends(1);
    harness.tick();
    peer.update();

    assert!(!harness.sorter.has_pending_changes(&harness.world));
    assert!(!peer.world.registry().valid(entity));

    harness.pump(&mut [&mut peer], 2);
    let transform = peer.world.registry().get::<Transform>(entity).unwrap();
    assert_eq!(transform.position(), Vec3::new(3.0, 2.0, 1.0));
    assert!(peer.session.is_joined());
}

#[test]
fn test_spawn_hint_conflict_keeps_existing_entity() {
    let mut harness = Harness::new();
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);

    peer.world.spawn_entity(42).unwrap();
    peer.world
        .registry_mut()
        .emplace(42, Transform::new(Vec3::splat(9.0), Quat::IDENTITY))
        .unwrap();
    let before = peer.world.registry().len();

    harness.world.spawn_entity(42).unwrap();
    harness
        .sorter
        .process_event(WorldEvent::SpawnEntity { new_id: 42 });
    harness.pump(&mut [&mut peer], 2);

    assert_eq!(peer.world.registry().len(), before);
    assert_eq!(
        peer.world.registry().get::<Transform>(42).unwrap().position(),
        Vec3::splat(9.0)
    );
    assert!(peer.session.is_joined());
}

#[test]
fn test_avatar_is_mirrored_and_removed_on_disconnect() {
    let mut harness = Harness::new();
    let mut mover = harness.connect("mover", &[A, B, C], true);
    let mut watcher = harness.connect("watcher", &[A, B, C], false);
    harness.pump(&mut [&mut mover, &mut watcher], 3);

    let mover_id = mover.session.client_id();
    let avatar_entity = harness.server.client(mover_id).unwrap().avatar_entities()[0];
    assert!(harness.world.registry().valid(avatar_entity));

    mover
        .avatar
        .as_mut()
        .unwrap()
        .move_camera(0.0, 0.0, 2.0, 0.0, 1.0);
    let expected = mover.avatar.as_ref().unwrap().position();
    harness.pump(&mut [&mut mover, &mut watcher], 3);

    let mirrored = watcher
        .world
        .registry()
        .get::<Transform>(avatar_entity)
        .unwrap()
        .position();
    assert!(mirrored.abs_diff_eq(expected, 1e-5));

    mover.session.disconnect();
    assert_eq!(mover.session.state(), SessionState::Disconnected);
    harness.pump(&mut [&mut watcher], 2);

    assert!(!harness.world.registry().valid(avatar_entity));
    assert!(!watcher.world.registry().valid(avatar_entity));
    assert!(harness.server.drain_events().any(|e| matches!(
        e,
        SessionEvent::ClientDisconnected { client_id, .. } if client_id == mover_id
    )));
}

#[test]
fn test_transport_problem_resets_client() {
    let mut harness = Harness::new();
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let handle = peer.session.connection().unwrap();
    peer.session
        .transport_mut()
        .simulate_problem(handle, "cable cut");
    peer.update();
    harness.tick();

    assert_eq!(peer.session.state(), SessionState::Disconnected);
    assert!(peer.session.connection().is_none());
    assert_eq!(peer.session.client_id(), NO_CLIENT);
    assert_eq!(harness.server.joined_count(), 0);
}

#[test]
fn test_broadcast_policy_controls_idle_updates() {
    let mut idle = Harness::new();
    let mut quiet = idle.connect("quiet", &[A, B, C], false);
    idle.pump(&mut [&mut quiet], 3);
    let applied = quiet.session.updates_applied();
    idle.pump(&mut [&mut quiet], 5);
    assert_eq!(quiet.session.updates_applied(), applied);

    let mut busy = Harness::with_config(SessionConfig {
        broadcast: BroadcastPolicy::EveryTick,
        ..SessionConfig::default()
    });
    let mut chatty = busy.connect("chatty", &[A, B, C], false);
    busy.pump(&mut [&mut chatty], 3);
    let applied = chatty.session.updates_applied();
    busy.pump(&mut [&mut chatty], 5);
    assert_eq!(chatty.session.updates_applied(), applied + 5);
}

#[test]
fn test_inbound_drain_is_bounded_per_tick() {
    let mut harness = Harness::with_config(SessionConfig {
        max_messages_per_tick: 1,
        ..SessionConfig::default()
    });
    let mut peer = harness.connect("ada", &[A, B, C], false);
    harness.pump(&mut [&mut peer], 3);
    assert!(peer.session.is_joined());

    let received = harness.server.stats().messages_received;
    for _ in 0..3 {
        peer.session
            .send_event(
                &ClientEvent::AvatarUpdate { avatar: Vec::new() },
                Delivery::Unreliable,
            )
            .unwrap();
    }
    peer.session.flush();

    harness.tick();
    assert_eq!(harness.server.stats().messages_received, received + 1);
    harness.tick();
    harness.tick();
    assert_eq!(harness.server.stats().messages_received, received + 3);
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use skein::config::SessionConfig;
use skein::content::ContentStore;
use skein::net::{ClientId, NetworkServer, NetworkStats, SessionEvent, UdpTransport};
use skein::world::{World, WorldEventSorter};

use crate::simulation::LightOrbit;

pub struct WorldServer {
    session: NetworkServer<UdpTransport>,
    world: World,
    sorter: WorldEventSorter,
    orbit: LightOrbit,
    local_addr: SocketAddr,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    start_time: Instant,
}

impl WorldServer {
    pub fn new(config: SessionConfig, content: Arc<dyn ContentStore>) -> Result<Self> {
        let addr = config.socket_addr();
        let mut transport =
            UdpTransport::listen(&addr).with_context(|| format!("failed to listen on {addr}"))?;
        transport.set_timeout(config.timeout());
        let local_addr = transport.local_addr();

        let mut world = World::new(Arc::clone(&content));
        let mut sorter = WorldEventSorter::new(config.dirty);
        for &prefab in content.initial_prefabs() {
            let instance = world
                .instantiate_prefab(prefab)
                .with_context(|| format!("failed to instantiate initial prefab {prefab:#010x}"))?;
            sorter.process_events(instance.events());
        }
        log::info!(
            "World ready: {} entities from {} initial prefabs",
            world.registry().len(),
            content.initial_prefabs().len()
        );

        let tick_duration = config.tick_duration();
        Ok(Self {
            session: NetworkServer::new(transport, content.checksums(), config),
            world,
            sorter,
            orbit: LightOrbit::new(),
            local_addr,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.session.drain_events()
    }

    /// Headless loop; session events go to the logger.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.session.drain_events() {
                let (level, message) = describe_event(&event);
                log::log!(level, "{message}");
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        let dt = self.tick_duration.as_secs_f32();
        self.orbit.step(&mut self.world, dt);
        self.world.update(dt);
        self.session.update(&mut self.world, &mut self.sorter);
    }

    pub fn kick_client(&mut self, client_id: ClientId) {
        self.session
            .kick(&mut self.world, &mut self.sorter, client_id, "kicked by server");
    }

    pub fn shutdown(&mut self) {
        log::info!("Closing {} connections", self.session.clients().count());
        self.session.shutdown(&mut self.world, &mut self.sorter);
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.session.tick(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            joined_count: self.session.joined_count(),
            connected_count: self.session.clients().count(),
            max_clients: self.session.config().max_clients,
            entity_count: self.world.registry().len(),
            network_stats: self.session.stats(),
        }
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .session
            .clients()
            .map(|c| ClientInfo {
                client_id: c.id(),
                username: c.username().to_string(),
                state: c.state().as_str(),
                connection: c.connection().to_string(),
                avatar_entities: c.avatar_entities().len(),
            })
            .collect();
        clients.sort_by_key(|c| c.client_id);
        clients
    }
}

pub fn describe_event(event: &SessionEvent) -> (log::Level, String) {
    match event {
        SessionEvent::ClientConnecting { connection } => (
            log::Level::Info,
            format!("Connection request on {connection}"),
        ),
        SessionEvent::ClientConnected { client_id } => {
            (log::Level::Info, format!("Client {client_id} connected"))
        }
        SessionEvent::ClientJoined {
            client_id,
            username,
        } => (
            log::Level::Info,
            format!("Client {client_id} joined as {username:?}"),
        ),
        SessionEvent::JoinRejected { client_id, reason } => (
            log::Level::Warn,
            format!("Rejected join from client {client_id}: {reason}"),
        ),
        SessionEvent::ClientDisconnected { client_id, detail } => (
            log::Level::Info,
            format!("Client {client_id} disconnected: {detail}"),
        ),
        SessionEvent::ProtocolViolation { client_id, message } => (
            log::Level::Error,
            format!("Client {client_id} sent a bad message: {message}"),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u64,
    pub uptime_secs: u64,
    pub joined_count: usize,
    pub connected_count: usize,
    pub max_clients: usize,
    pub entity_count: usize,
    pub network_stats: NetworkStats,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub username: String,
    pub state: &'static str,
    pub connection: String,
    pub avatar_entities: usize,
}

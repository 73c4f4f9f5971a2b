use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use skein::avatar::{AvatarType, SpectatorAvatar};
use skein::component::{MeshRenderer, PointLight};
use skein::config::SessionConfig;
use skein::content::{ContentStore, StaticContent};
use skein::net::{NetworkClient, SessionState, UdpTransport};
use skein::world::World;

const STATUS_INTERVAL: Duration = Duration::from_secs(2);
/// Radians per second the spectator turns while drifting.
const ORBIT_TURN_RATE: f32 = 0.25;
const ORBIT_SPEED: f32 = 1.0;

pub struct App {
    session: NetworkClient<UdpTransport>,
    world: World,
    avatar: SpectatorAvatar,
    tick_duration: Duration,
    ticks: u64,
    last_status: Instant,
    was_joined: bool,
}

impl App {
    pub fn connect(server: &str, content: StaticContent, config: SessionConfig) -> Result<Self> {
        let (mut transport, connection) = UdpTransport::connect(server)
            .with_context(|| format!("failed to connect to {server}"))?;
        transport.set_timeout(config.timeout());

        let checksums = content.checksums();
        let content: Arc<dyn ContentStore> = Arc::new(content);
        let tick_duration = config.tick_duration();
        let username = config.username.clone();

        let mut avatar = SpectatorAvatar::new();
        avatar.move_camera(0.0, 0.2, 0.0, 0.0, 1.7);

        Ok(Self {
            session: NetworkClient::connect(
                transport,
                connection,
                username,
                Some(AvatarType::Spectator),
                checksums,
                config,
            ),
            world: World::new(content),
            avatar,
            tick_duration,
            ticks: 0,
            last_status: Instant::now(),
            was_joined: false,
        })
    }

    /// Ticks until the session ends, the join is refused, or `max_ticks`
    /// have run.
    pub fn run(&mut self, max_ticks: Option<u64>) {
        loop {
            let started = Instant::now();
            self.tick();

            if max_ticks.is_some_and(|max| self.ticks >= max) {
                log::info!("Tick limit reached");
                break;
            }
            if let Some(reason) = self.session.rejection() {
                log::error!("Join refused: {reason}");
                break;
            }
            if self.session.state() == SessionState::Disconnected {
                if self.was_joined {
                    log::info!("Session ended");
                } else {
                    log::error!("Could not reach the server");
                }
                break;
            }

            if let Some(remaining) = self.tick_duration.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
        self.log_status();
        self.session.disconnect();
    }

    fn tick(&mut self) {
        let dt = self.tick_duration.as_secs_f32();
        self.ticks += 1;

        if self.session.is_joined() {
            self.was_joined = true;
            self.avatar
                .move_camera(ORBIT_TURN_RATE * dt, 0.0, ORBIT_SPEED * dt, 0.0, 0.0);
        }
        self.session.update(&mut self.world, Some(&self.avatar));
        self.world.update(dt);

        if self.last_status.elapsed() >= STATUS_INTERVAL {
            self.last_status = Instant::now();
            self.log_status();
        }
    }

    fn log_status(&self) {
        let registry = self.world.registry();
        let stats = self.session.stats();
        log::info!(
            "[{}] client {} | {} entities ({} meshes, {} lights) | {} updates | rtt {:.1}ms",
            self.session.state().as_str(),
            self.session.client_id(),
            registry.len(),
            registry.count::<MeshRenderer>(),
            registry.count::<PointLight>(),
            self.session.updates_applied(),
            stats.rtt_ms
        );
    }
}

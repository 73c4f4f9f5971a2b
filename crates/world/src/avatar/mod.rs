//! Per-client presence in the world.
//!
//! The client owns the avatar state and streams it to the server, which
//! mirrors it into world entities that every peer can see.

mod spectator;

use rkyv::rancor;

use crate::world::{EntityId, RegistryError, World};

pub use crate::net::protocol::AvatarType;
pub use spectator::{SpectatorAvatar, SpectatorPose};

#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    #[error("failed to encode avatar state: {0}")]
    Encode(rancor::Error),
    #[error("failed to decode avatar state: {0}")]
    Decode(rancor::Error),
    #[error("avatar state contains non-finite values")]
    NonFinite,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub trait Avatar {
    fn avatar_type(&self) -> AvatarType;

    /// Opaque state blob carried by `AvatarUpdate`.
    fn serialize(&self) -> Result<Vec<u8>, AvatarError>;

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), AvatarError>;

    /// Creates the entities that represent this avatar in `world`.
    fn attach(&mut self, world: &mut World) -> Result<Vec<EntityId>, AvatarError>;

    /// Pushes the current state into the attached entities.
    fn sync_world(&mut self, world: &mut World) -> Result<(), AvatarError>;

    /// Destroys the attached entities and returns their ids.
    fn detach(&mut self, world: &mut World) -> Vec<EntityId>;

    fn entities(&self) -> &[EntityId];
}

pub fn create_avatar(avatar_type: AvatarType) -> Box<dyn Avatar> {
    match avatar_type {
        AvatarType::Spectator => Box::new(SpectatorAvatar::new()),
    }
}

//! Replicated entity-component world state: registry, synchronized
//! components, hierarchy, and the client/server sessions that keep remote
//! copies of a world consistent.

pub mod avatar;
pub mod component;
pub mod config;
pub mod content;
pub mod net;
pub mod script;
pub mod world;

pub use avatar::{Avatar, AvatarError, SpectatorAvatar, create_avatar};
pub use component::{
    ComponentType, MeshRenderer, PointLight, Relationship, SyncRegistry, SynchronizedComponent,
    Transform,
};
pub use config::{BroadcastPolicy, ConfigError, DirtyPolicy, SessionConfig};
pub use content::{AssetId, ContentError, ContentManifest, ContentStore, LumpChecksum, StaticContent};
pub use net::{
    LoopbackNetwork, LoopbackTransport, NetworkClient, NetworkServer, NetworkStats, Transport,
    UdpTransport,
};
pub use script::{NullScriptRuntime, ScriptError, ScriptRuntime};
pub use world::{
    EntityId, EntityRegistry, NULL_ENTITY, PrefabInstance, RegistryError, World, WorldError,
    WorldEventSorter,
};

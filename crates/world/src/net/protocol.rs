use std::mem::size_of;

use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::content::{AssetId, LumpChecksum};
use crate::world::{EntityId, RegistryError};

pub const PROTOCOL_MAGIC: u32 = 0x534B_4E31;
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 10555;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// `u32 length | u32 magic | u32 version`, all little-endian.
pub const FRAME_HEADER_SIZE: usize = 12;

pub type ClientId = u32;

/// Client id of a connection that has not joined yet.
pub const NO_CLIENT: ClientId = 0;
/// Destination that addresses every joined client.
pub const ALL_CLIENTS: ClientId = u32::MAX;
pub const FIRST_CLIENT_ID: ClientId = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is {0} bytes, shorter than its header")]
    Truncated(usize),
    #[error("frame declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("protocol version mismatch: ours {expected}, theirs {received}")]
    VersionMismatch { expected: u32, received: u32 },
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error(
        "{component} batch has {entities} entities of {payload_size} bytes but {bytes} payload bytes"
    )]
    BatchSizeMismatch {
        component: &'static str,
        entities: usize,
        payload_size: usize,
        bytes: usize,
    },
    #[error("unknown component type {0}")]
    UnknownComponentType(u16),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum AvatarType {
    Spectator,
}

/// Components of one type for many entities: `payloads` is the concatenation
/// of one fixed-size record per entry in `entities`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentBatch {
    pub component_type: u16,
    pub entities: Vec<EntityId>,
    pub payloads: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ScriptUpdate {
    pub entity: EntityId,
    pub script: AssetId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum WorldEvent {
    SpawnEntity { new_id: EntityId },
    DestroyEntity { id: EntityId },
    UpdateComponents(ComponentBatch),
    UpdateScripts(ScriptUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct JoinRequest {
    pub username: String,
    pub avatar_type: Option<AvatarType>,
    pub lump_checksums: Vec<LumpChecksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ClientEvent {
    JoinRequest(JoinRequest),
    AvatarUpdate { avatar: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum JoinRejectReason {
    ChecksumCountMismatch { expected: u32, received: u32 },
    ChecksumMismatch { index: u32 },
    VersionMismatch { expected: u32, received: u32 },
    ServerFull,
}

impl std::fmt::Display for JoinRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumCountMismatch { expected, received } => write!(
                f,
                "lump count mismatch: server has {expected}, client sent {received}"
            ),
            Self::ChecksumMismatch { index } => write!(f, "lump {index} checksum mismatch"),
            Self::VersionMismatch { expected, received } => write!(
                f,
                "protocol version mismatch: server speaks {expected}, client {received}"
            ),
            Self::ServerFull => write!(f, "server is full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ServerEvent {
    Announcement { message: String },
    AssignClientId { new_id: ClientId },
    WorldUpdate { events: Vec<WorldEvent> },
    JoinRejected { reason: JoinRejectReason },
}

fn frame(body: &[u8]) -> Vec<u8> {
    let length = (body.len() + FRAME_HEADER_SIZE - 4) as u32;
    let mut out = Vec::with_capacity(body.len() + FRAME_HEADER_SIZE);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Validates the frame header and returns the body copied into aligned
/// storage.
fn unframe(data: &[u8]) -> Result<AlignedVec, ProtocolError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::Truncated(data.len()));
    }
    let declared = read_u32(data, 0) as usize;
    if declared != data.len() - 4 {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: data.len() - 4,
        });
    }
    let magic = read_u32(data, 4);
    if magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let version = read_u32(data, 8);
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: version,
        });
    }

    let body = &data[FRAME_HEADER_SIZE..];
    let mut aligned = AlignedVec::<16>::with_capacity(body.len());
    aligned.extend_from_slice(body);
    Ok(aligned)
}

/// Upper bound of the archived size of one `WorldEvent`, excluding the
/// vectors it points to.
const WORLD_EVENT_OVERHEAD: usize = 64;
/// Room for the frame header and the `WorldUpdate` envelope.
const WORLD_UPDATE_OVERHEAD: usize = 256;

impl ComponentBatch {
    /// Bytes per entity in `payloads`.
    pub fn payload_size(&self) -> usize {
        if self.entities.is_empty() {
            0
        } else {
            self.payloads.len() / self.entities.len()
        }
    }

    /// Splits into ordered batches of at most `max_entities` entries each.
    pub fn split(&self, max_entities: usize) -> Vec<ComponentBatch> {
        let max_entities = max_entities.max(1);
        let size = self.payload_size();
        self.entities
            .chunks(max_entities)
            .enumerate()
            .map(|(index, entities)| {
                let start = index * max_entities * size;
                ComponentBatch {
                    component_type: self.component_type,
                    entities: entities.to_vec(),
                    payloads: self.payloads[start..start + entities.len() * size].to_vec(),
                }
            })
            .collect()
    }
}

impl WorldEvent {
    /// Conservative estimate of what this event adds to an encoded
    /// `WorldUpdate`.
    pub fn encoded_size_hint(&self) -> usize {
        WORLD_EVENT_OVERHEAD
            + match self {
                WorldEvent::SpawnEntity { .. } | WorldEvent::DestroyEntity { .. } => 0,
                WorldEvent::UpdateComponents(batch) => {
                    batch.entities.len() * size_of::<EntityId>() + batch.payloads.len()
                }
                WorldEvent::UpdateScripts(update) => update.data.len(),
            }
    }
}

/// Groups `events`, in order, into world updates that encode to at most
/// `max_bytes` and carry at most `max_events` events. Component batches that
/// cannot fit on their own are split by entity. An empty input yields one
/// empty update.
pub fn pack_world_updates(
    events: &[WorldEvent],
    max_bytes: usize,
    max_events: usize,
) -> Vec<Vec<WorldEvent>> {
    let budget = max_bytes
        .saturating_sub(WORLD_UPDATE_OVERHEAD)
        .max(2 * WORLD_EVENT_OVERHEAD);
    let max_events = max_events.max(1);

    let pieces = events.iter().flat_map(|event| match event {
        WorldEvent::UpdateComponents(batch) if event.encoded_size_hint() > budget => {
            let per_entity = size_of::<EntityId>() + batch.payload_size();
            batch
                .split((budget - WORLD_EVENT_OVERHEAD) / per_entity)
                .into_iter()
                .map(WorldEvent::UpdateComponents)
                .collect::<Vec<_>>()
        }
        _ => vec![event.clone()],
    });

    let mut updates = Vec::new();
    let mut current: Vec<WorldEvent> = Vec::new();
    let mut current_size = 0;
    for event in pieces {
        let size = event.encoded_size_hint();
        if !current.is_empty() && (current_size + size > budget || current.len() >= max_events) {
            updates.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(event);
    }

    if !current.is_empty() || updates.is_empty() {
        updates.push(current);
    }
    updates
}

impl ClientEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(ProtocolError::Serialize)?;
        Ok(frame(&body))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let body = unframe(data)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body).map_err(ProtocolError::Deserialize)
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(ProtocolError::Serialize)?;
        Ok(frame(&body))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let body = unframe(data)?;
        rkyv::from_bytes::<Self, rancor::Error>(&body).map_err(ProtocolError::Deserialize)
    }
}

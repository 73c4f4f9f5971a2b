use bytemuck::{Pod, Zeroable};

use super::{ComponentType, SyncState, SynchronizedComponent};
use crate::world::{EntityId, NULL_ENTITY};

/// Parent link plus a circular doubly-linked ring of siblings.
///
/// A detached entity points at itself for both siblings.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RelationshipData {
    pub parent: EntityId,
    pub child_count: u32,
    pub first_child: EntityId,
    pub prev_sibling: EntityId,
    pub next_sibling: EntityId,
}

impl RelationshipData {
    pub fn detached(owner: EntityId) -> Self {
        Self {
            parent: NULL_ENTITY,
            child_count: 0,
            first_child: NULL_ENTITY,
            prev_sibling: owner,
            next_sibling: owner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Relationship {
    sync: SyncState<RelationshipData>,
}

impl Relationship {
    pub fn new(owner: EntityId) -> Self {
        Self {
            sync: SyncState::new(RelationshipData::detached(owner)),
        }
    }

    pub fn parent(&self) -> EntityId {
        self.sync.data().parent
    }

    pub fn child_count(&self) -> u32 {
        self.sync.data().child_count
    }

    pub fn first_child(&self) -> EntityId {
        self.sync.data().first_child
    }

    pub fn next_sibling(&self) -> EntityId {
        self.sync.data().next_sibling
    }

    pub fn prev_sibling(&self) -> EntityId {
        self.sync.data().prev_sibling
    }
}

impl SynchronizedComponent for Relationship {
    type Payload = RelationshipData;

    const TYPE: ComponentType = ComponentType::Relationship;

    fn from_payload(payload: RelationshipData) -> Self {
        Self {
            sync: SyncState::received(payload),
        }
    }

    fn sync(&self) -> &SyncState<RelationshipData> {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncState<RelationshipData> {
        &mut self.sync
    }
}

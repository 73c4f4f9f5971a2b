use std::collections::HashMap;

use super::registry::{EntityId, EntityRegistry, NULL_ENTITY};
use crate::component::Uuid;
use crate::net::stats::rand_u64;

/// Hands out persistent 64-bit identities and maps them back to entities.
#[derive(Debug, Default)]
pub struct IdentifierFactory {
    entities: HashMap<u64, EntityId>,
}

impl IdentifierFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entity's identity, assigning a fresh one on first use.
    pub fn uuid(&mut self, registry: &mut EntityRegistry, entity: EntityId) -> Option<u64> {
        if let Some(existing) = registry.get::<Uuid>(entity) {
            return Some(existing.0);
        }
        if !registry.valid(entity) {
            return None;
        }

        let value = self.fresh();
        registry.emplace(entity, Uuid(value)).ok()?;
        self.entities.insert(value, entity);
        Some(value)
    }

    /// Entity holding `uuid`, or the null entity.
    pub fn entity(&self, uuid: u64) -> EntityId {
        self.entities.get(&uuid).copied().unwrap_or(NULL_ENTITY)
    }

    /// Forgets the identity of an entity that is about to be destroyed.
    pub fn release(&mut self, registry: &EntityRegistry, entity: EntityId) {
        if let Some(uuid) = registry.get::<Uuid>(entity) {
            self.entities.remove(&uuid.0);
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn fresh(&self) -> u64 {
        loop {
            let candidate = rand_u64();
            if candidate != 0 && !self.entities.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};

/// Opaque entity handle shared by every peer in a session.
pub type EntityId = u32;

/// Reserved "no entity" value; never allocated.
pub const NULL_ENTITY: EntityId = 0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("entity {0} does not exist")]
    EntityNotFound(EntityId),
    #[error("entity {0} already has a {1} component")]
    AlreadyPresent(EntityId, &'static str),
    #[error("requested entity id {0} is already in use")]
    IdTaken(EntityId),
    #[error("the null entity cannot be allocated")]
    NullHint,
}

trait ErasedStorage: Any {
    fn remove(&mut self, entity: EntityId) -> bool;
    fn contains(&self, entity: EntityId) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Sparse set of one component type: dense values plus an owner array and an
/// id -> slot index.
struct Storage<T> {
    values: Vec<T>,
    owners: Vec<EntityId>,
    slots: HashMap<EntityId, usize>,
}

impl<T> Storage<T> {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            owners: Vec::new(),
            slots: HashMap::new(),
        }
    }

    fn insert(&mut self, entity: EntityId, value: T) -> &mut T {
        let slot = match self.slots.get(&entity) {
            Some(&slot) => {
                self.values[slot] = value;
                slot
            }
            None => {
                let slot = self.values.len();
                self.values.push(value);
                self.owners.push(entity);
                self.slots.insert(entity, slot);
                slot
            }
        };
        &mut self.values[slot]
    }

    fn get(&self, entity: EntityId) -> Option<&T> {
        self.slots.get(&entity).map(|&slot| &self.values[slot])
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        match self.slots.get(&entity) {
            Some(&slot) => Some(&mut self.values[slot]),
            None => None,
        }
    }

    fn take(&mut self, entity: EntityId) -> Option<T> {
        let slot = self.slots.remove(&entity)?;
        let value = self.values.swap_remove(slot);
        self.owners.swap_remove(slot);
        if let Some(&moved) = self.owners.get(slot) {
            self.slots.insert(moved, slot);
        }
        Some(value)
    }
}

impl<T: 'static> ErasedStorage for Storage<T> {
    fn remove(&mut self, entity: EntityId) -> bool {
        self.take(entity).is_some()
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.slots.contains_key(&entity)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sparse entity -> heterogeneous component store.
///
/// Entities are plain integer keys. `create_with_hint` honors ids chosen by a
/// remote peer so replicated worlds keep the same numbering on every side.
pub struct EntityRegistry {
    entities: BTreeSet<EntityId>,
    next_id: EntityId,
    storages: HashMap<TypeId, Box<dyn ErasedStorage>>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.entities.len())
            .field("next_id", &self.next_id)
            .field("component_types", &self.storages.len())
            .finish()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            entities: BTreeSet::new(),
            next_id: 1,
            storages: HashMap::new(),
        }
    }

    /// Allocates an id that has never been handed out and is not in use.
    pub fn create(&mut self) -> EntityId {
        while self.next_id == NULL_ENTITY || self.entities.contains(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entities.insert(id);
        id
    }

    /// Allocates exactly `hint`, failing if it is taken.
    pub fn create_with_hint(&mut self, hint: EntityId) -> Result<EntityId, RegistryError> {
        if hint == NULL_ENTITY {
            return Err(RegistryError::NullHint);
        }
        if !self.entities.insert(hint) {
            return Err(RegistryError::IdTaken(hint));
        }
        if hint >= self.next_id {
            self.next_id = hint.wrapping_add(1);
        }
        Ok(hint)
    }

    pub fn valid(&self, entity: EntityId) -> bool {
        self.entities.contains(&entity)
    }

    /// Drops every component of `entity` and releases the id.
    pub fn destroy(&mut self, entity: EntityId) -> bool {
        if !self.entities.remove(&entity) {
            return false;
        }
        for storage in self.storages.values_mut() {
            storage.remove(entity);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Ascending snapshot of live entity ids.
    pub fn entities(&self) -> Vec<EntityId> {
        self.entities.iter().copied().collect()
    }

    pub fn has<T: 'static>(&self, entity: EntityId) -> bool {
        self.storages
            .get(&TypeId::of::<T>())
            .is_some_and(|storage| storage.contains(entity))
    }

    pub fn get<T: 'static>(&self, entity: EntityId) -> Option<&T> {
        self.storage::<T>()?.get(entity)
    }

    pub fn get_mut<T: 'static>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storage_mut::<T>()?.get_mut(entity)
    }

    pub fn emplace<T: 'static>(&mut self, entity: EntityId, value: T) -> Result<&mut T, RegistryError> {
        if !self.valid(entity) {
            return Err(RegistryError::EntityNotFound(entity));
        }
        if self.has::<T>(entity) {
            return Err(RegistryError::AlreadyPresent(
                entity,
                std::any::type_name::<T>(),
            ));
        }
        Ok(self.storage_or_insert::<T>().insert(entity, value))
    }

    pub fn emplace_or_replace<T: 'static>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<&mut T, RegistryError> {
        if !self.valid(entity) {
            return Err(RegistryError::EntityNotFound(entity));
        }
        Ok(self.storage_or_insert::<T>().insert(entity, value))
    }

    pub fn get_or_emplace<T: Default + 'static>(
        &mut self,
        entity: EntityId,
    ) -> Result<&mut T, RegistryError> {
        self.get_or_emplace_with(entity, T::default)
    }

    pub fn get_or_emplace_with<T: 'static>(
        &mut self,
        entity: EntityId,
        init: impl FnOnce() -> T,
    ) -> Result<&mut T, RegistryError> {
        if !self.valid(entity) {
            return Err(RegistryError::EntityNotFound(entity));
        }
        let storage = self.storage_or_insert::<T>();
        if !storage.slots.contains_key(&entity) {
            storage.insert(entity, init());
        }
        storage
            .get_mut(entity)
            .ok_or(RegistryError::EntityNotFound(entity))
    }

    pub fn remove<T: 'static>(&mut self, entity: EntityId) -> Option<T> {
        self.storage_mut::<T>()?.take(entity)
    }

    /// Snapshot of every entity holding `T`, in storage order.
    ///
    /// Taken up front so callers may mutate the registry while walking it:
    /// entities added afterwards are not visited, removed ones simply fail
    /// their `get`.
    pub fn view<T: 'static>(&self) -> Vec<EntityId> {
        self.storage::<T>()
            .map(|storage| storage.owners.clone())
            .unwrap_or_default()
    }

    pub fn iter<T: 'static>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storage::<T>()
            .into_iter()
            .flat_map(|storage| storage.owners.iter().copied().zip(storage.values.iter()))
    }

    pub fn iter_mut<T: 'static>(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.storage_mut::<T>()
            .into_iter()
            .flat_map(|storage| storage.owners.iter().copied().zip(storage.values.iter_mut()))
    }

    pub fn count<T: 'static>(&self) -> usize {
        self.storage::<T>().map_or(0, |storage| storage.values.len())
    }

    fn storage<T: 'static>(&self) -> Option<&Storage<T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|storage| storage.as_any().downcast_ref::<Storage<T>>())
    }

    fn storage_mut<T: 'static>(&mut self) -> Option<&mut Storage<T>> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|storage| storage.as_any_mut().downcast_mut::<Storage<T>>())
    }

    fn storage_or_insert<T: 'static>(&mut self) -> &mut Storage<T> {
        let storage = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Storage::<T>::new()));
        match storage.as_any_mut().downcast_mut::<Storage<T>>() {
            Some(storage) => storage,
            None => unreachable!("storage keyed by TypeId holds its own type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Health(u32);

    #[derive(Debug, PartialEq)]
    struct Name(&'static str);

    #[test]
    fn create_never_reuses_live_ids() {
        let mut registry = EntityRegistry::new();
        let a = registry.create();
        let b = registry.create();
        assert_ne!(a, NULL_ENTITY);
        assert_ne!(a, b);

        registry.create_with_hint(b + 1).unwrap();
        let c = registry.create();
        assert!(c > b + 1);
    }

    #[test]
    fn hint_conflict_is_an_error() {
        let mut registry = EntityRegistry::new();
        assert_eq!(registry.create_with_hint(42), Ok(42));
        assert_eq!(registry.create_with_hint(42), Err(RegistryError::IdTaken(42)));
        assert_eq!(registry.create_with_hint(NULL_ENTITY), Err(RegistryError::NullHint));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn emplace_get_and_destroy() {
        let mut registry = EntityRegistry::new();
        let e = registry.create();

        registry.emplace(e, Health(10)).unwrap();
        assert!(registry.has::<Health>(e));
        assert!(!registry.has::<Name>(e));
        assert!(matches!(
            registry.emplace(e, Health(3)),
            Err(RegistryError::AlreadyPresent(..))
        ));

        registry.get_mut::<Health>(e).unwrap().0 = 7;
        assert_eq!(registry.get::<Health>(e), Some(&Health(7)));

        assert!(registry.destroy(e));
        assert!(!registry.valid(e));
        assert!(registry.get::<Health>(e).is_none());
        assert_eq!(
            registry.emplace(e, Health(1)).err(),
            Some(RegistryError::EntityNotFound(e))
        );
    }

    #[test]
    fn get_or_emplace_keeps_existing_value() {
        let mut registry = EntityRegistry::new();
        let e = registry.create();

        registry.get_or_emplace::<Health>(e).unwrap().0 = 5;
        assert_eq!(registry.get_or_emplace::<Health>(e).unwrap().0, 5);
    }

    #[test]
    fn swap_remove_keeps_slots_consistent() {
        let mut registry = EntityRegistry::new();
        let ids: Vec<_> = (0..4).map(|_| registry.create()).collect();
        for (i, &id) in ids.iter().enumerate() {
            registry.emplace(id, Health(i as u32)).unwrap();
        }

        registry.remove::<Health>(ids[0]);
        for (i, &id) in ids.iter().enumerate().skip(1) {
            assert_eq!(registry.get::<Health>(id), Some(&Health(i as u32)));
        }
        assert_eq!(registry.count::<Health>(), 3);
    }

    #[test]
    fn view_is_stable_under_mutation() {
        let mut registry = EntityRegistry::new();
        let a = registry.create();
        let b = registry.create();
        registry.emplace(a, Name("a")).unwrap();
        registry.emplace(b, Name("b")).unwrap();

        let mut visited = Vec::new();
        for entity in registry.view::<Name>() {
            if entity == a {
                registry.destroy(b);
                let late = registry.create();
                registry.emplace(late, Name("late")).unwrap();
            }
            if let Some(name) = registry.get::<Name>(entity) {
                visited.push(name.0);
            }
        }

        assert_eq!(visited, vec!["a"]);
    }
}

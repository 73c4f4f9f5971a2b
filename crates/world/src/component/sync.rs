use std::mem::size_of;

use super::{
    ComponentType, MeshRenderer, PointLight, Relationship, SynchronizedComponent, Transform,
};
use crate::content::ContentStore;
use crate::net::protocol::{ComponentBatch, ProtocolError};
use crate::world::{EntityRegistry, NULL_ENTITY};

type CollectFn = fn(&EntityRegistry, bool) -> Option<ComponentBatch>;
type ApplyFn = fn(&mut EntityRegistry, &ComponentBatch, &dyn ContentStore) -> Result<usize, ProtocolError>;
type CleanFn = fn(&mut EntityRegistry);
type DirtyFn = fn(&EntityRegistry) -> usize;

/// Type-erased operations for one synchronized component type.
#[derive(Clone, Copy)]
pub struct SyncEntry {
    pub component_type: ComponentType,
    pub payload_size: usize,
    collect: CollectFn,
    apply: ApplyFn,
    clean: CleanFn,
    dirty: DirtyFn,
}

impl std::fmt::Debug for SyncEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEntry")
            .field("component_type", &self.component_type)
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

impl SyncEntry {
    fn of<T: SynchronizedComponent>() -> Self {
        Self {
            component_type: T::TYPE,
            payload_size: size_of::<T::Payload>(),
            collect: collect_batch::<T>,
            apply: apply_batch::<T>,
            clean: mark_clean::<T>,
            dirty: count_dirty::<T>,
        }
    }
}

/// Ordered table of every component type that crosses the wire.
///
/// Batches are produced in registration order, so every peer must register
/// the same types.
#[derive(Debug, Clone)]
pub struct SyncRegistry {
    entries: Vec<SyncEntry>,
}

impl Default for SyncRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<Transform>();
        registry.register::<MeshRenderer>();
        registry.register::<PointLight>();
        registry.register::<Relationship>();
        registry
    }
}

impl SyncRegistry {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Adds `T`; re-registering a type is ignored.
    pub fn register<T: SynchronizedComponent>(&mut self) {
        if self.get(T::TYPE).is_none() {
            self.entries.push(SyncEntry::of::<T>());
        }
    }

    pub fn get(&self, component_type: ComponentType) -> Option<&SyncEntry> {
        self.entries
            .iter()
            .find(|entry| entry.component_type == component_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.iter()
    }

    /// One batch per type that has something to send.
    pub fn collect(&self, registry: &EntityRegistry, dirty_only: bool) -> Vec<ComponentBatch> {
        self.entries
            .iter()
            .filter_map(|entry| (entry.collect)(registry, dirty_only))
            .collect()
    }

    /// Applies `batch`, returning how many entities it touched.
    pub fn apply(
        &self,
        registry: &mut EntityRegistry,
        batch: &ComponentBatch,
        content: &dyn ContentStore,
    ) -> Result<usize, ProtocolError> {
        let component_type = ComponentType::from_tag(batch.component_type)
            .ok_or(ProtocolError::UnknownComponentType(batch.component_type))?;
        let entry = self
            .get(component_type)
            .ok_or(ProtocolError::UnknownComponentType(batch.component_type))?;
        (entry.apply)(registry, batch, content)
    }

    pub fn mark_all_clean(&self, registry: &mut EntityRegistry) {
        for entry in &self.entries {
            (entry.clean)(registry);
        }
    }

    pub fn dirty_count(&self, registry: &EntityRegistry) -> usize {
        self.entries.iter().map(|entry| (entry.dirty)(registry)).sum()
    }

    pub fn has_dirty(&self, registry: &EntityRegistry) -> bool {
        self.dirty_count(registry) > 0
    }
}

fn collect_batch<T: SynchronizedComponent>(
    registry: &EntityRegistry,
    dirty_only: bool,
) -> Option<ComponentBatch> {
    let mut entities = Vec::new();
    let mut payloads = Vec::new();

    for (entity, component) in registry.iter::<T>() {
        if dirty_only && !component.is_dirty() {
            continue;
        }
        entities.push(entity);
        payloads.extend_from_slice(bytemuck::bytes_of(component.sync().data()));
    }

    if entities.is_empty() {
        return None;
    }

    Some(ComponentBatch {
        component_type: T::TYPE.tag(),
        entities,
        payloads,
    })
}

fn apply_batch<T: SynchronizedComponent>(
    registry: &mut EntityRegistry,
    batch: &ComponentBatch,
    content: &dyn ContentStore,
) -> Result<usize, ProtocolError> {
    let size = size_of::<T::Payload>();
    let expected = batch.entities.len().checked_mul(size);
    if expected != Some(batch.payloads.len()) {
        return Err(ProtocolError::BatchSizeMismatch {
            component: T::TYPE.name(),
            entities: batch.entities.len(),
            payload_size: size,
            bytes: batch.payloads.len(),
        });
    }

    let mut applied = 0;
    for (&entity, chunk) in batch.entities.iter().zip(batch.payloads.chunks_exact(size)) {
        if entity == NULL_ENTITY {
            log::warn!("Ignoring {} payload for the null entity", T::TYPE.name());
            continue;
        }
        if T::locally_owned(registry, entity) {
            continue;
        }

        let payload: T::Payload = bytemuck::pod_read_unaligned(chunk);

        if !registry.valid(entity) {
            log::warn!(
                "Component update for unknown entity {entity}, creating it ({})",
                T::TYPE.name()
            );
            registry.create_with_hint(entity)?;
        }

        match registry.get_mut::<T>(entity) {
            Some(component) => {
                if component.write_data(payload) {
                    component.refresh(content);
                }
                component.mark_clean();
            }
            None => {
                let mut component = T::from_payload(payload);
                component.refresh(content);
                registry.emplace(entity, component)?;
            }
        }
        applied += 1;
    }

    Ok(applied)
}

fn mark_clean<T: SynchronizedComponent>(registry: &mut EntityRegistry) {
    for (_, component) in registry.iter_mut::<T>() {
        component.mark_clean();
    }
}

fn count_dirty<T: SynchronizedComponent>(registry: &EntityRegistry) -> usize {
    registry
        .iter::<T>()
        .filter(|(_, component)| component.is_dirty())
        .count()
}

//! The replicated world: entity registry plus everything that interprets it.

mod event_sorter;
pub mod hierarchy;
mod identity;
mod registry;

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};

use crate::component::{
    MeshRenderer, PointLight, ScriptBinding, SyncRegistry, SynchronizedComponent, Transform,
};
use crate::content::{AssetId, ContentStore};
use crate::net::protocol::{ProtocolError, ScriptUpdate, WorldEvent};
use crate::script::{NullScriptRuntime, ScriptError, ScriptInstanceId, ScriptRuntime};

pub use event_sorter::WorldEventSorter;
pub use hierarchy::HierarchyError;
pub use identity::IdentifierFactory;
pub use registry::{EntityId, EntityRegistry, NULL_ENTITY, RegistryError};

/// Nesting limit for prefab children; deeper definitions are assumed cyclic.
const MAX_PREFAB_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("prefab {0:#010x} is not defined")]
    UnknownPrefab(AssetId),
    #[error("prefab {0:#010x} nests too deeply (cyclic children?)")]
    PrefabTooDeep(AssetId),
    #[error("entity {0} already exists")]
    SpawnConflict(EntityId),
}

/// Entities created by one prefab instantiation, root first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefabInstance {
    pub root: EntityId,
    pub entities: Vec<EntityId>,
    pub scripts: Vec<ScriptUpdate>,
}

impl PrefabInstance {
    /// Global events that announce this instance to remote peers.
    pub fn events(&self) -> Vec<WorldEvent> {
        self.entities
            .iter()
            .map(|&new_id| WorldEvent::SpawnEntity { new_id })
            .chain(self.scripts.iter().cloned().map(WorldEvent::UpdateScripts))
            .collect()
    }
}

pub struct World {
    registry: EntityRegistry,
    content: Arc<dyn ContentStore>,
    sync: SyncRegistry,
    identifiers: IdentifierFactory,
    scripts: Box<dyn ScriptRuntime>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("registry", &self.registry)
            .field("sync", &self.sync)
            .field("scripts", &self.scripts.instance_count())
            .finish()
    }
}

impl World {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self::with_scripts(content, Box::new(NullScriptRuntime::new()))
    }

    pub fn with_scripts(content: Arc<dyn ContentStore>, scripts: Box<dyn ScriptRuntime>) -> Self {
        Self {
            registry: EntityRegistry::new(),
            content,
            sync: SyncRegistry::default(),
            identifiers: IdentifierFactory::new(),
            scripts,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    pub fn sync_registry(&self) -> &SyncRegistry {
        &self.sync
    }

    pub fn scripts(&self) -> &dyn ScriptRuntime {
        self.scripts.as_ref()
    }

    pub fn create_entity(&mut self) -> EntityId {
        self.registry.create()
    }

    /// Creates exactly `id`, failing if it already exists.
    pub fn spawn_entity(&mut self, id: EntityId) -> Result<EntityId, WorldError> {
        if self.registry.valid(id) {
            return Err(WorldError::SpawnConflict(id));
        }
        Ok(self.registry.create_with_hint(id)?)
    }

    /// Detaches the entity from the hierarchy, drops its script, then frees it.
    pub fn destroy_entity(&mut self, entity: EntityId) -> bool {
        if !self.registry.valid(entity) {
            return false;
        }

        for child in hierarchy::children(&self.registry, entity) {
            if let Err(e) = hierarchy::orphan(&mut self.registry, child) {
                log::warn!("Failed to detach child {child} of {entity}: {e}");
            }
        }
        if let Err(e) = hierarchy::orphan(&mut self.registry, entity) {
            log::warn!("Failed to detach entity {entity}: {e}");
        }

        if let Some(binding) = self.registry.get::<ScriptBinding>(entity) {
            let instance = binding.instance;
            if let Err(e) = self.scripts.destroy(instance) {
                log::debug!("Script instance of entity {entity} already gone: {e}");
            }
        }

        self.identifiers.release(&self.registry, entity);
        self.registry.destroy(entity)
    }

    pub fn adopt(&mut self, parent: EntityId, child: EntityId) -> Result<(), HierarchyError> {
        hierarchy::adopt(&mut self.registry, parent, child)
    }

    pub fn orphan(&mut self, child: EntityId) -> Result<(), RegistryError> {
        hierarchy::orphan(&mut self.registry, child)
    }

    pub fn children(&self, parent: EntityId) -> Vec<EntityId> {
        hierarchy::children(&self.registry, parent)
    }

    pub fn world_transform(&self, entity: EntityId) -> Option<Mat4> {
        self.registry
            .get::<Transform>(entity)
            .map(Transform::world_matrix)
    }

    pub fn uuid(&mut self, entity: EntityId) -> Option<u64> {
        self.identifiers.uuid(&mut self.registry, entity)
    }

    pub fn entity_by_uuid(&self, uuid: u64) -> EntityId {
        self.identifiers.entity(uuid)
    }

    /// Binds `script` to `entity`, replacing any previous binding.
    pub fn attach_script(
        &mut self,
        entity: EntityId,
        script: AssetId,
        data: &[u8],
    ) -> Result<ScriptInstanceId, WorldError> {
        if !self.registry.valid(entity) {
            return Err(RegistryError::EntityNotFound(entity).into());
        }
        if let Some(previous) = self.registry.remove::<ScriptBinding>(entity) {
            if let Err(e) = self.scripts.destroy(previous.instance) {
                log::debug!("Replaced script instance was already gone: {e}");
            }
        }

        let instance = self.scripts.instantiate(entity, script, data)?;
        self.registry.emplace_or_replace(
            entity,
            ScriptBinding {
                script,
                instance,
                data: data.to_vec(),
            },
        )?;
        Ok(instance)
    }

    /// Instantiates a prefab and its children, parenting children under the
    /// root.
    pub fn instantiate_prefab(&mut self, prefab: AssetId) -> Result<PrefabInstance, WorldError> {
        let mut instance = PrefabInstance::default();
        match self.instantiate_prefab_at(prefab, 0, &mut instance) {
            Ok(root) => instance.root = root,
            Err(e) => {
                for entity in instance.entities {
                    self.destroy_entity(entity);
                }
                return Err(e);
            }
        }
        log::debug!(
            "Instantiated prefab {prefab:#010x} as entity {} ({} entities)",
            instance.root,
            instance.entities.len()
        );
        Ok(instance)
    }

    fn instantiate_prefab_at(
        &mut self,
        prefab: AssetId,
        depth: usize,
        instance: &mut PrefabInstance,
    ) -> Result<EntityId, WorldError> {
        if depth >= MAX_PREFAB_DEPTH {
            return Err(WorldError::PrefabTooDeep(prefab));
        }
        let definition = self
            .content
            .prefab(prefab)
            .cloned()
            .ok_or(WorldError::UnknownPrefab(prefab))?;

        let entity = self.registry.create();
        instance.entities.push(entity);

        if let Some(transform) = &definition.transform {
            self.registry.emplace(
                entity,
                Transform::new(
                    Vec3::from_array(transform.position),
                    Quat::from_array(transform.orientation),
                ),
            )?;
        }
        if let Some(mesh) = &definition.mesh_renderer {
            let mut renderer = MeshRenderer::new(mesh.mesh, mesh.material);
            renderer.refresh(self.content.as_ref());
            self.registry.emplace(entity, renderer)?;
        }
        if let Some(light) = &definition.point_light {
            self.registry.emplace(
                entity,
                PointLight::new(
                    Vec3::from_array(light.position),
                    Vec3::from_array(light.intensity),
                ),
            )?;
        }
        if let Some(script) = &definition.script {
            self.attach_script(entity, script.asset, &script.data)?;
            instance.scripts.push(ScriptUpdate {
                entity,
                script: script.asset,
                data: script.data.clone(),
            });
        }

        for child in &definition.children {
            let child_entity = self.instantiate_prefab_at(*child, depth + 1, instance)?;
            self.adopt(entity, child_entity)?;
        }

        Ok(entity)
    }

    /// Advances scripts and recomputes world transforms.
    pub fn update(&mut self, dt: f32) {
        self.scripts.update(&mut self.registry, dt);
        hierarchy::update_world_transforms(&mut self.registry);
    }

    pub fn mark_all_clean(&mut self) {
        self.sync.mark_all_clean(&mut self.registry);
    }

    /// Applies one event received from the server.
    pub fn apply_event(&mut self, event: &WorldEvent) -> Result<(), WorldError> {
        match event {
            WorldEvent::SpawnEntity { new_id } => {
                self.spawn_entity(*new_id)?;
            }
            WorldEvent::DestroyEntity { id } => {
                if !self.destroy_entity(*id) {
                    return Err(RegistryError::EntityNotFound(*id).into());
                }
            }
            WorldEvent::UpdateComponents(batch) => {
                self.sync
                    .apply(&mut self.registry, batch, self.content.as_ref())?;
            }
            WorldEvent::UpdateScripts(update) => {
                self.attach_script(update.entity, update.script, &update.data)?;
            }
        }
        Ok(())
    }

    /// Like [`World::apply_event`] but logs failures instead of returning them;
    /// a bad event never stops the ones after it.
    pub fn process_event(&mut self, event: &WorldEvent) {
        if let Err(e) = self.apply_event(event) {
            match e {
                WorldError::SpawnConflict(id) => {
                    log::warn!("Spawned entity's id is taken: {id}");
                }
                WorldError::Protocol(e) => log::error!("Dropping component update: {e}"),
                e => log::warn!("Failed to apply world event: {e}"),
            }
        }
    }
}

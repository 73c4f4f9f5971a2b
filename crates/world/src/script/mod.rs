//! Script runtime seam. Scripts are opaque: the world only tracks which
//! instance is bound to which entity and forwards the per-frame update.

use std::collections::HashMap;

use crate::content::AssetId;
use crate::world::{EntityId, EntityRegistry};

pub type ScriptInstanceId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script asset {0:#010x} is not loaded")]
    UnknownScript(AssetId),
    #[error("script instance {0} does not exist")]
    UnknownInstance(ScriptInstanceId),
    #[error("script {script:#010x} failed: {message}")]
    Runtime { script: AssetId, message: String },
}

pub trait ScriptRuntime {
    fn instantiate(
        &mut self,
        entity: EntityId,
        script: AssetId,
        data: &[u8],
    ) -> Result<ScriptInstanceId, ScriptError>;

    fn destroy(&mut self, instance: ScriptInstanceId) -> Result<(), ScriptError>;

    fn update(&mut self, registry: &mut EntityRegistry, dt: f32);

    fn instance_count(&self) -> usize;
}

#[derive(Debug, Clone)]
struct Instance {
    entity: EntityId,
    script: AssetId,
    data: Vec<u8>,
}

/// Runtime that records bindings but runs nothing.
#[derive(Debug, Default)]
pub struct NullScriptRuntime {
    next_instance: ScriptInstanceId,
    instances: HashMap<ScriptInstanceId, Instance>,
}

impl NullScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(&self, id: ScriptInstanceId) -> Option<(EntityId, AssetId, &[u8])> {
        self.instances
            .get(&id)
            .map(|instance| (instance.entity, instance.script, instance.data.as_slice()))
    }
}

impl ScriptRuntime for NullScriptRuntime {
    fn instantiate(
        &mut self,
        entity: EntityId,
        script: AssetId,
        data: &[u8],
    ) -> Result<ScriptInstanceId, ScriptError> {
        self.next_instance = self.next_instance.wrapping_add(1);
        let id = self.next_instance;
        self.instances.insert(
            id,
            Instance {
                entity,
                script,
                data: data.to_vec(),
            },
        );
        log::debug!("Script {script:#010x} bound to entity {entity} as instance {id}");
        Ok(id)
    }

    fn destroy(&mut self, instance: ScriptInstanceId) -> Result<(), ScriptError> {
        self.instances
            .remove(&instance)
            .map(|_| ())
            .ok_or(ScriptError::UnknownInstance(instance))
    }

    fn update(&mut self, registry: &mut EntityRegistry, _dt: f32) {
        self.instances
            .retain(|_, instance| registry.valid(instance.entity));
    }

    fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_die_with_their_entity() {
        let mut registry = EntityRegistry::new();
        let entity = registry.create();
        let mut runtime = NullScriptRuntime::new();

        let id = runtime.instantiate(entity, 0xabc, b"cfg").unwrap();
        assert_eq!(runtime.instance(id), Some((entity, 0xabc, &b"cfg"[..])));

        registry.destroy(entity);
        runtime.update(&mut registry, 0.016);
        assert_eq!(runtime.instance_count(), 0);
        assert_eq!(runtime.destroy(id), Err(ScriptError::UnknownInstance(id)));
    }
}

use std::collections::VecDeque;

use super::World;
use crate::component::ScriptBinding;
use crate::config::DirtyPolicy;
use crate::net::protocol::{ScriptUpdate, WorldEvent};

/// Server-side staging area for the next world broadcast.
///
/// Global events (spawns, destroys, script bindings) queue here in arrival
/// order; component changes are not queued but read from dirty flags when the
/// broadcast is assembled.
#[derive(Debug, Default)]
pub struct WorldEventSorter {
    queue: VecDeque<WorldEvent>,
    dirty_policy: DirtyPolicy,
}

impl WorldEventSorter {
    pub fn new(dirty_policy: DirtyPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            dirty_policy,
        }
    }

    pub fn dirty_policy(&self) -> DirtyPolicy {
        self.dirty_policy
    }

    pub fn process_event(&mut self, event: WorldEvent) {
        self.queue.push_back(event);
    }

    pub fn process_events(&mut self, events: impl IntoIterator<Item = WorldEvent>) {
        self.queue.extend(events);
    }

    /// True while global events are waiting; component dirtiness is not
    /// considered.
    pub fn is_out_of_date(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn has_pending_changes(&self, world: &World) -> bool {
        self.is_out_of_date() || world.sync_registry().has_dirty(world.registry())
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queued global events followed by one batch per dirty component type.
    pub fn broadcast_global_events(&self, world: &World) -> Vec<WorldEvent> {
        let mut events: Vec<WorldEvent> = self.queue.iter().cloned().collect();
        events.extend(
            world
                .sync_registry()
                .collect(world.registry(), true)
                .into_iter()
                .map(WorldEvent::UpdateComponents),
        );
        events
    }

    /// Complete description of the current world for a late joiner.
    pub fn full_snapshot(&self, world: &World) -> Vec<WorldEvent> {
        let registry = world.registry();
        let mut events: Vec<WorldEvent> = registry
            .entities()
            .into_iter()
            .map(|new_id| WorldEvent::SpawnEntity { new_id })
            .collect();
        events.extend(
            world
                .sync_registry()
                .collect(registry, false)
                .into_iter()
                .map(WorldEvent::UpdateComponents),
        );
        events.extend(registry.iter::<ScriptBinding>().map(|(entity, binding)| {
            WorldEvent::UpdateScripts(ScriptUpdate {
                entity,
                script: binding.script,
                data: binding.data.clone(),
            })
        }));
        events
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Called once the broadcast has been handed to the transport.
    pub fn finish_broadcast(&mut self, world: &mut World) {
        self.clear_queue();
        if self.dirty_policy == DirtyPolicy::ClearOnSend {
            world.mark_all_clean();
        }
    }
}

//! Parent/child links stored as Relationship components, and the pass that
//! turns local transforms into world transforms.
//!
//! Every edit goes through `write_data` on a payload copy so dirty tracking
//! picks up each touched relationship.

use std::collections::{HashMap, HashSet, VecDeque};

use glam::Mat4;

use super::registry::{EntityId, EntityRegistry, NULL_ENTITY, RegistryError};
use crate::component::{Relationship, RelationshipData, SynchronizedComponent, Transform};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("entity {0} cannot adopt itself")]
    SelfAdoption(EntityId),
    #[error("adopting {child} under {parent} would create a cycle")]
    Cycle { parent: EntityId, child: EntityId },
}

fn relationship(
    registry: &mut EntityRegistry,
    entity: EntityId,
) -> Result<RelationshipData, RegistryError> {
    registry
        .get_or_emplace_with(entity, || Relationship::new(entity))
        .map(|relationship| relationship.data())
}

fn edit(
    registry: &mut EntityRegistry,
    entity: EntityId,
    f: impl FnOnce(&mut RelationshipData),
) -> Result<(), RegistryError> {
    let relationship = registry.get_or_emplace_with(entity, || Relationship::new(entity))?;
    let mut data = relationship.data();
    f(&mut data);
    relationship.write_data(data);
    Ok(())
}

pub fn parent_of(registry: &EntityRegistry, entity: EntityId) -> Option<EntityId> {
    registry
        .get::<Relationship>(entity)
        .map(Relationship::parent)
        .filter(|&parent| parent != NULL_ENTITY)
}

/// Children of `parent`, starting at its first child and following the ring.
pub fn children(registry: &EntityRegistry, parent: EntityId) -> Vec<EntityId> {
    let Some(rel) = registry.get::<Relationship>(parent) else {
        return Vec::new();
    };
    let count = rel.child_count() as usize;
    let first = rel.first_child();
    let mut out = Vec::with_capacity(count);
    if first == NULL_ENTITY {
        return out;
    }

    let mut current = first;
    while out.len() < count {
        out.push(current);
        match registry.get::<Relationship>(current) {
            Some(sibling) if sibling.next_sibling() != first => current = sibling.next_sibling(),
            _ => break,
        }
    }
    out
}

fn is_ancestor(registry: &EntityRegistry, ancestor: EntityId, entity: EntityId) -> bool {
    let mut seen = HashSet::new();
    let mut current = parent_of(registry, entity);
    while let Some(parent) = current {
        if parent == ancestor {
            return true;
        }
        if !seen.insert(parent) {
            return false;
        }
        current = parent_of(registry, parent);
    }
    false
}

/// Makes `child` the newest child of `parent`, detaching it from any previous
/// parent first. The child is spliced in right after the current first child.
pub fn adopt(
    registry: &mut EntityRegistry,
    parent: EntityId,
    child: EntityId,
) -> Result<(), HierarchyError> {
    if parent == child {
        return Err(HierarchyError::SelfAdoption(child));
    }
    for entity in [parent, child] {
        if !registry.valid(entity) {
            return Err(RegistryError::EntityNotFound(entity).into());
        }
    }
    if is_ancestor(registry, child, parent) {
        return Err(HierarchyError::Cycle { parent, child });
    }

    orphan(registry, child)?;

    let parent_data = relationship(registry, parent)?;
    if parent_data.child_count == 0 || parent_data.first_child == NULL_ENTITY {
        edit(registry, child, |rel| {
            rel.parent = parent;
            rel.prev_sibling = child;
            rel.next_sibling = child;
        })?;
        edit(registry, parent, |rel| {
            rel.first_child = child;
            rel.child_count = 1;
        })?;
        return Ok(());
    }

    let first = parent_data.first_child;
    let after = relationship(registry, first)?.next_sibling;

    edit(registry, child, |rel| {
        rel.parent = parent;
        rel.prev_sibling = first;
        rel.next_sibling = after;
    })?;
    edit(registry, first, |rel| rel.next_sibling = child)?;
    edit(registry, after, |rel| rel.prev_sibling = child)?;
    edit(registry, parent, |rel| rel.child_count += 1)?;
    Ok(())
}

/// Detaches `child` from its parent. A no-op for entities without a parent.
pub fn orphan(registry: &mut EntityRegistry, child: EntityId) -> Result<(), RegistryError> {
    let Some(data) = registry.get::<Relationship>(child).map(Relationship::data) else {
        return Ok(());
    };
    let parent = data.parent;
    if parent == NULL_ENTITY {
        return Ok(());
    }

    if !registry.has::<Relationship>(parent) {
        log::warn!("Entity {child} names parent {parent}, which has no relationship");
        edit(registry, child, |rel| *rel = RelationshipData::detached(child))?;
        return Ok(());
    }

    let (prev, next) = (data.prev_sibling, data.next_sibling);
    edit(registry, parent, |rel| {
        if rel.first_child == child {
            rel.first_child = if next == child { NULL_ENTITY } else { next };
        }
        rel.child_count = rel.child_count.saturating_sub(1);
        if rel.child_count == 0 {
            rel.first_child = NULL_ENTITY;
        }
    })?;

    if prev != child && registry.has::<Relationship>(prev) {
        edit(registry, prev, |rel| rel.next_sibling = next)?;
    }
    if next != child && registry.has::<Relationship>(next) {
        edit(registry, next, |rel| rel.prev_sibling = prev)?;
    }

    let keep_children = (data.first_child, data.child_count);
    edit(registry, child, |rel| {
        *rel = RelationshipData::detached(child);
        (rel.first_child, rel.child_count) = keep_children;
    })?;
    Ok(())
}

/// Transform-bearing entities ordered so every parent precedes its children.
///
/// Entities whose parent is missing or has no Transform are roots. Members of
/// a cycle are appended at the end and treated as roots.
pub fn transform_order(registry: &EntityRegistry) -> Vec<EntityId> {
    let entities = registry.view::<Transform>();
    let present: HashSet<EntityId> = entities.iter().copied().collect();

    let mut roots = Vec::new();
    let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
    for &entity in &entities {
        match parent_of(registry, entity).filter(|parent| present.contains(parent)) {
            Some(parent) if parent != entity => children.entry(parent).or_default().push(entity),
            _ => roots.push(entity),
        }
    }

    let mut order = Vec::with_capacity(entities.len());
    let mut visited = HashSet::with_capacity(entities.len());
    let mut queue: VecDeque<EntityId> = roots.into_iter().collect();
    while let Some(entity) = queue.pop_front() {
        if !visited.insert(entity) {
            continue;
        }
        order.push(entity);
        if let Some(kids) = children.get(&entity) {
            queue.extend(kids.iter().copied());
        }
    }

    if order.len() < entities.len() {
        for &entity in &entities {
            if !visited.contains(&entity) {
                log::warn!("Entity {entity} is part of a parent cycle; treating it as a root");
                visited.insert(entity);
                order.push(entity);
            }
        }
    }
    order
}

/// Recomputes the cached world matrix of every Transform.
pub fn update_world_transforms(registry: &mut EntityRegistry) {
    let mut computed: HashMap<EntityId, Mat4> = HashMap::new();
    for entity in transform_order(registry) {
        let parent_world = parent_of(registry, entity)
            .and_then(|parent| computed.get(&parent).copied())
            .unwrap_or(Mat4::IDENTITY);
        let Some(transform) = registry.get_mut::<Transform>(entity) else {
            continue;
        };
        let world = parent_world * transform.local_matrix();
        transform.set_world_matrix(world);
        computed.insert(entity, world);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn ring(registry: &EntityRegistry, start: EntityId) -> Vec<EntityId> {
        let mut out = vec![start];
        let mut current = registry.get::<Relationship>(start).unwrap().next_sibling();
        while current != start {
            out.push(current);
            current = registry.get::<Relationship>(current).unwrap().next_sibling();
        }
        out
    }

    fn assert_ring_consistent(registry: &EntityRegistry, parent: EntityId) {
        let kids = children(registry, parent);
        let rel = registry.get::<Relationship>(parent).unwrap();
        assert_eq!(kids.len(), rel.child_count() as usize);
        for &kid in &kids {
            let k = registry.get::<Relationship>(kid).unwrap();
            assert_eq!(k.parent(), parent);
            let next = registry.get::<Relationship>(k.next_sibling()).unwrap();
            assert_eq!(next.prev_sibling(), kid);
        }
    }

    #[test]
    fn adopt_builds_a_ring() {
        let mut registry = EntityRegistry::new();
        let p = registry.create();
        let a = registry.create();
        let b = registry.create();
        let c = registry.create();

        adopt(&mut registry, p, a).unwrap();
        let rel = registry.get::<Relationship>(a).unwrap();
        assert_eq!((rel.prev_sibling(), rel.next_sibling()), (a, a));

        adopt(&mut registry, p, b).unwrap();
        adopt(&mut registry, p, c).unwrap();

        assert_eq!(registry.get::<Relationship>(p).unwrap().child_count(), 3);
        assert_eq!(registry.get::<Relationship>(p).unwrap().first_child(), a);
        assert_eq!(ring(&registry, a), vec![a, c, b]);
        assert_ring_consistent(&registry, p);
    }

    #[test]
    fn orphan_unlinks_and_clears_first_child() {
        let mut registry = EntityRegistry::new();
        let p = registry.create();
        let a = registry.create();
        let b = registry.create();
        adopt(&mut registry, p, a).unwrap();
        adopt(&mut registry, p, b).unwrap();

        orphan(&mut registry, a).unwrap();
        let parent = registry.get::<Relationship>(p).unwrap();
        assert_eq!(parent.child_count(), 1);
        assert_eq!(parent.first_child(), b);
        assert_ring_consistent(&registry, p);
        assert_eq!(ring(&registry, b), vec![b]);

        let detached = registry.get::<Relationship>(a).unwrap();
        assert_eq!(detached.parent(), NULL_ENTITY);
        assert_eq!((detached.prev_sibling(), detached.next_sibling()), (a, a));

        orphan(&mut registry, b).unwrap();
        let parent = registry.get::<Relationship>(p).unwrap();
        assert_eq!(parent.child_count(), 0);
        assert_eq!(parent.first_child(), NULL_ENTITY);

        orphan(&mut registry, b).unwrap();
    }

    #[test]
    fn reparenting_moves_between_rings() {
        let mut registry = EntityRegistry::new();
        let p = registry.create();
        let q = registry.create();
        let a = registry.create();
        let b = registry.create();
        adopt(&mut registry, p, a).unwrap();
        adopt(&mut registry, p, b).unwrap();

        adopt(&mut registry, q, a).unwrap();
        assert_eq!(children(&registry, p), vec![b]);
        assert_eq!(children(&registry, q), vec![a]);
        assert_ring_consistent(&registry, p);
        assert_ring_consistent(&registry, q);
    }

    #[test]
    fn rejects_self_adoption_and_cycles() {
        let mut registry = EntityRegistry::new();
        let a = registry.create();
        let b = registry.create();
        assert_eq!(adopt(&mut registry, a, a), Err(HierarchyError::SelfAdoption(a)));

        adopt(&mut registry, a, b).unwrap();
        assert_eq!(
            adopt(&mut registry, b, a),
            Err(HierarchyError::Cycle { parent: b, child: a })
        );
        assert_eq!(
            adopt(&mut registry, a, 99),
            Err(HierarchyError::Registry(RegistryError::EntityNotFound(99)))
        );
    }

    #[test]
    fn world_transforms_compose_parent_first() {
        let mut registry = EntityRegistry::new();
        let child = registry.create();
        let parent = registry.create();
        registry
            .emplace(child, Transform::new(Vec3::X, Quat::IDENTITY))
            .unwrap();
        registry
            .emplace(
                parent,
                Transform::new(
                    Vec3::new(0.0, 5.0, 0.0),
                    Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
                ),
            )
            .unwrap();
        adopt(&mut registry, parent, child).unwrap();

        let order = transform_order(&registry);
        assert_eq!(order, vec![parent, child]);

        update_world_transforms(&mut registry);
        let world = registry.get::<Transform>(child).unwrap().world_position();
        assert!(world.abs_diff_eq(Vec3::new(0.0, 5.0, -1.0), 1e-5));
    }

    #[test]
    fn deep_chain_adopted_out_of_order() {
        let mut registry = EntityRegistry::new();
        let locals = [
            (Vec3::new(1.0, 0.0, 0.0), Quat::from_rotation_z(std::f32::consts::FRAC_PI_2)),
            (Vec3::new(0.0, 2.0, 0.0), Quat::IDENTITY),
            (Vec3::new(0.0, 0.0, 3.0), Quat::from_rotation_y(std::f32::consts::FRAC_PI_2)),
            (Vec3::new(4.0, 0.0, 0.0), Quat::IDENTITY),
            (Vec3::new(0.0, 5.0, 0.0), Quat::IDENTITY),
        ];

        // Deepest first, so every child has a lower id than its parent.
        let mut chain = vec![NULL_ENTITY; locals.len()];
        for depth in (0..locals.len()).rev() {
            let entity = registry.create();
            let (position, rotation) = locals[depth];
            registry.emplace(entity, Transform::new(position, rotation)).unwrap();
            chain[depth] = entity;
        }
        for depth in [2, 0, 3, 1] {
            adopt(&mut registry, chain[depth], chain[depth + 1]).unwrap();
        }

        let order = transform_order(&registry);
        assert_eq!(order, chain);

        update_world_transforms(&mut registry);
        let expected = locals
            .iter()
            .fold(Mat4::IDENTITY, |acc, &(position, rotation)| {
                acc * Mat4::from_rotation_translation(rotation, position)
            });
        let leaf = registry.get::<Transform>(chain[4]).unwrap().world_position();
        assert!(leaf.abs_diff_eq(expected.w_axis.truncate(), 1e-4));
        assert!(leaf.abs_diff_eq(Vec3::new(-6.0, 0.0, -1.0), 1e-4));
    }

    #[test]
    fn random_adopt_and_orphan_keeps_rings_intact() {
        const ENTITIES: usize = 8;
        let mut registry = EntityRegistry::new();
        let entities: Vec<EntityId> = (0..ENTITIES).map(|_| registry.create()).collect();

        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for round in 0..200 {
            for _ in 0..60 {
                let a = entities[(next() % ENTITIES as u64) as usize];
                let b = entities[(next() % ENTITIES as u64) as usize];
                if next() % 3 == 0 {
                    orphan(&mut registry, a).unwrap();
                } else {
                    match adopt(&mut registry, a, b) {
                        Ok(()) => assert_eq!(parent_of(&registry, b), Some(a)),
                        Err(HierarchyError::SelfAdoption(_) | HierarchyError::Cycle { .. }) => {}
                        Err(err) => panic!("round {round}: unexpected {err}"),
                    }
                }

                let mut linked = 0;
                for &parent in &entities {
                    let Some(rel) = registry.get::<Relationship>(parent) else {
                        continue;
                    };
                    let count = rel.child_count() as usize;
                    linked += count;
                    if count == 0 {
                        assert_eq!(rel.first_child(), NULL_ENTITY);
                        continue;
                    }
                    let members = ring(&registry, rel.first_child());
                    assert_eq!(members.len(), count, "round {round}: ring of {parent}");
                    assert_ring_consistent(&registry, parent);
                }
                let with_parent = entities
                    .iter()
                    .filter(|&&entity| parent_of(&registry, entity).is_some())
                    .count();
                assert_eq!(linked, with_parent);
            }
        }
    }

    #[test]
    fn parent_without_transform_counts_as_identity() {
        let mut registry = EntityRegistry::new();
        let group = registry.create();
        let child = registry.create();
        registry
            .emplace(child, Transform::new(Vec3::Z, Quat::IDENTITY))
            .unwrap();
        adopt(&mut registry, group, child).unwrap();

        update_world_transforms(&mut registry);
        assert_eq!(registry.get::<Transform>(child).unwrap().world_position(), Vec3::Z);
    }

    #[test]
    fn corrupt_cycle_is_tolerated() {
        let mut registry = EntityRegistry::new();
        let a = registry.create();
        let b = registry.create();
        for (entity, parent) in [(a, b), (b, a)] {
            registry.emplace(entity, Transform::default()).unwrap();
            let mut data = RelationshipData::detached(entity);
            data.parent = parent;
            registry.emplace(entity, Relationship::from_payload(data)).unwrap();
        }

        let order = transform_order(&registry);
        assert_eq!(order.len(), 2);
        update_world_transforms(&mut registry);
    }
}

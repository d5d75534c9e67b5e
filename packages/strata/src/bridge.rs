//! Synchronising component data with an external system.
//!
//! A bridge mirrors one component type into something outside the registry,
//! such as a physics engine or renderer. Changes flow out through `push` for
//! every dirty component, and back in through `pull`, which marks the
//! components it changes dirty.

use crate::component::Component;
use crate::entity::EntityID;
use crate::sparse_set::SparseSet;

/// The external side of a component mirror.
pub trait ComponentBridge<T: Component> {
    /// Receive a component which changed inside the registry.
    fn push(&mut self, entity: EntityID, component: &T);

    /// Offer the external value for a component.
    ///
    /// Return true if `component` was modified.
    fn pull(&mut self, entity: EntityID, component: &mut T) -> bool;
}

/// Push every dirty component through the bridge and clear its dirty flag.
pub fn push_changes<T: Component>(storage: &mut SparseSet<T>, bridge: &mut impl ComponentBridge<T>) -> usize {
    let dirty: Vec<usize> = storage.iter_dirty().collect();
    for &slot in dirty.iter() {
        if let (Some(entity), Some(component)) = (storage.entity_at(slot), storage.component_at(slot)) {
            bridge.push(entity, component);
        }
        storage.clear_dirty(slot);
    }

    dirty.len()
}

/// Pull every component from the bridge, marking changed components dirty.
pub fn pull_changes<T: Component>(storage: &mut SparseSet<T>, bridge: &mut impl ComponentBridge<T>) -> usize {
    let mut changed = 0;
    for slot in 0..storage.len() {
        let entity = match storage.entity_at(slot) {
            Some(entity) => entity,
            None => break,
        };

        let modified = match storage.component_at_mut(slot) {
            Some(component) => bridge.pull(entity, component),
            None => false,
        };

        if modified {
            storage.set_dirty(slot);
            changed += 1;
        }
    }

    changed
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::{component, Registry};

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Transform(f32);

    component!(Transform);

    #[derive(Default)]
    struct Mirror {
        pushed: Vec<(EntityID, f32)>,
        external: HashMap<EntityID, f32>,
    }

    impl ComponentBridge<Transform> for Mirror {
        fn push(&mut self, entity: EntityID, component: &Transform) {
            self.pushed.push((entity, component.0));
        }

        fn pull(&mut self, entity: EntityID, component: &mut Transform) -> bool {
            match self.external.get(&entity) {
                Some(&value) if value != component.0 => {
                    component.0 = value;
                    true
                }
                _ => false,
            }
        }
    }

    #[test]
    fn test_push_clears_dirty() {
        let mut registry = Registry::new();
        let a = registry.create();
        let b = registry.create();
        registry.add(a, Transform(1.0));
        registry.add(b, Transform(2.0));

        let mut mirror = Mirror::default();
        assert_eq!(registry.push_changes(&mut mirror), 2);
        assert_eq!(mirror.pushed, vec![(a, 1.0), (b, 2.0)]);
        assert_eq!(registry.read::<Transform>().unwrap().dirty_count(), 0);

        assert_eq!(registry.push_changes(&mut mirror), 0);
    }

    #[test]
    fn test_pull_sets_dirty() {
        let mut registry = Registry::new();
        let a = registry.create();
        let b = registry.create();
        registry.add(a, Transform(1.0));
        registry.add(b, Transform(2.0));
        registry.clear_all_dirty_bits();

        let mut mirror = Mirror::default();
        mirror.external.insert(b, 5.0);
        mirror.external.insert(a, 1.0);

        assert_eq!(registry.pull_changes(&mut mirror), 1);
        assert_eq!(registry.get::<Transform>(b), Some(Transform(5.0)));

        let storage = registry.read::<Transform>().unwrap();
        assert!(!storage.is_dirty(0));
        assert!(storage.is_dirty(1));
    }
}

//! Fluent queries.
//!
//! Queries are the general (non-bitset) path for finding entities: they name
//! the component types an entity must have, the types it must not have, and
//! an optional predicate. Iteration is driven from the smallest required
//! storage, and each candidate is checked against the other required types,
//! then the excluded types, then the predicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLockReadGuard;

use crate::component::{Component, ComponentTypeID};
use crate::component_set::ComponentSet;
use crate::entity::EntityID;
use crate::registry::{Registry, RegistryEvent, SubscriptionID};
use crate::sparse_set::ErasedStorage;

type Filter<'a> = Box<dyn Fn(&Registry, EntityID) -> bool + 'a>;

/// A query under construction.
pub struct QueryBuilder<'a> {
    registry: &'a Registry,
    required: ComponentSet,
    excluded: ComponentSet,
    filters: Vec<Filter<'a>>,
}

impl<'a> QueryBuilder<'a> {
    /// Create a new query which matches nothing until a type is required.
    pub fn new(registry: &'a Registry) -> QueryBuilder<'a> {
        QueryBuilder {
            registry,
            required: ComponentSet::default(),
            excluded: ComponentSet::default(),
            filters: Vec::new(),
        }
    }

    /// Require that matching entities have a component of type `T`.
    pub fn with<T: Component>(self) -> Self {
        self.with_type(T::type_id())
    }

    /// Require that matching entities have the given component type.
    pub fn with_type(mut self, component_type: ComponentTypeID) -> Self {
        self.required.insert(component_type);
        self
    }

    /// Exclude entities which have a component of type `T`.
    pub fn without<T: Component>(self) -> Self {
        self.without_type(T::type_id())
    }

    /// Exclude entities which have the given component type.
    pub fn without_type(mut self, component_type: ComponentTypeID) -> Self {
        self.excluded.insert(component_type);
        self
    }

    /// Only match entities for which `predicate` returns true.
    ///
    /// Predicates run after the component checks, in the order they were added.
    pub fn filter(mut self, predicate: impl Fn(&Registry, EntityID) -> bool + 'a) -> Self {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Call `f` for every matching entity.
    pub fn for_each(&self, mut f: impl FnMut(EntityID)) {
        let mut required: Vec<RwLockReadGuard<'_, Box<dyn ErasedStorage>>> = Vec::with_capacity(self.required.len());
        for component_type in self.required.iter() {
            match self.registry.read_erased(*component_type) {
                Some(guard) => required.push(guard),
                None => return,
            }
        }

        let excluded: Vec<_> = self.excluded.iter()
            .filter_map(|t| self.registry.read_erased(*t))
            .collect();

        let driver = match (0..required.len()).min_by_key(|idx| required[*idx].len()) {
            Some(driver) => driver,
            None => return,
        };

        for slot in 0..required[driver].len() {
            let entity = match required[driver].entity_at(slot) {
                Some(entity) => entity,
                None => break,
            };

            let matched = required.iter().enumerate().all(|(idx, s)| idx == driver || s.contains(entity))
                && !excluded.iter().any(|s| s.contains(entity))
                && self.filters.iter().all(|p| p(self.registry, entity));

            if matched {
                f(entity);
            }
        }
    }

    /// Collect every matching entity.
    pub fn entities(&self) -> Vec<EntityID> {
        let mut result = Vec::new();
        self.for_each(|e| result.push(e));
        result
    }

    /// Count the matching entities.
    pub fn count(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| count += 1);
        count
    }
}

/// A query whose results are kept between calls.
///
/// The cached query subscribes to registry events, and only re-runs when an
/// entity is destroyed, one of its component types is added or removed, or a
/// snapshot is restored. Dropping the query without calling `detach` leaves
/// its observer registered until the next event, which prunes it.
pub struct CachedQuery {
    required: ComponentSet,
    excluded: ComponentSet,
    stale: Arc<AtomicBool>,
    subscription: SubscriptionID,
    entities: Vec<EntityID>,
    rebuilds: u64,
}

impl CachedQuery {
    /// Create a new cached query and subscribe it to the registry.
    pub fn new(registry: &mut Registry, required: &[ComponentTypeID], excluded: &[ComponentTypeID]) -> CachedQuery {
        let required = ComponentSet::new(required.to_vec());
        let excluded = ComponentSet::new(excluded.to_vec());
        let stale = Arc::new(AtomicBool::new(true));

        let watched = {
            let mut all = required.clone();
            for t in excluded.iter() {
                all.insert(*t);
            }
            all
        };
        let flag = Arc::downgrade(&stale);
        let subscription = registry.subscribe_while(move |event| {
            let flag = match flag.upgrade() {
                Some(flag) => flag,
                None => return false,
            };

            let touched = match event {
                RegistryEvent::EntityCreated(_) => false,
                RegistryEvent::EntityDestroyed(_) | RegistryEvent::Restored => true,
                RegistryEvent::ComponentAdded(_, t) | RegistryEvent::ComponentRemoved(_, t) => watched.includes(t),
            };

            if touched {
                flag.store(true, Ordering::Release);
            }
            true
        });

        CachedQuery {
            required,
            excluded,
            stale,
            subscription,
            entities: Vec::new(),
            rebuilds: 0,
        }
    }

    /// Returns true if the next call to `entities` will re-run the query.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Return the number of times the query has been re-run.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Return the matching entities, re-running the query if needed.
    pub fn entities(&mut self, registry: &Registry) -> &[EntityID] {
        if self.stale.swap(false, Ordering::AcqRel) {
            let mut query = registry.query();
            for t in self.required.iter() {
                query = query.with_type(*t);
            }
            for t in self.excluded.iter() {
                query = query.without_type(*t);
            }

            self.entities = query.entities();
            self.rebuilds += 1;
        }

        &self.entities
    }

    /// Unsubscribe from the registry.
    pub fn detach(self, registry: &mut Registry) {
        registry.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position(i32);

    component!(Position);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Frozen;

    component!(Frozen);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Label(u8);

    component!(Label);

    #[test]
    fn test_with_without_filter() {
        let mut registry = Registry::new();
        let a = registry.create();
        let b = registry.create();
        let c = registry.create();
        registry.add(a, Position(1));
        registry.add(b, Position(2));
        registry.add(c, Position(3));
        registry.add(b, Frozen);

        let moving = registry.query().with::<Position>().without::<Frozen>().entities();
        assert_eq!(moving, vec![a, c]);

        let big = registry.query()
            .with::<Position>()
            .filter(|r, e| r.get::<Position>(e).map_or(false, |p| p.0 > 1))
            .entities();
        assert_eq!(big, vec![b, c]);
    }

    #[test]
    fn test_smallest_set_drives() {
        let mut registry = Registry::new();
        let mut tagged = Vec::new();
        for i in 0..50 {
            let e = registry.create();
            registry.add(e, Position(i));
            if i % 10 == 0 {
                registry.add(e, Label(i as u8));
                tagged.push(e);
            }
        }

        let evaluated = std::cell::Cell::new(0);
        let found = registry.query()
            .with::<Position>()
            .with::<Label>()
            .filter(|_, _| {
                evaluated.set(evaluated.get() + 1);
                true
            })
            .entities();

        assert_eq!(found, tagged);
        assert_eq!(evaluated.get(), 5);
    }

    #[test]
    fn test_missing_required_type() {
        #[derive(Debug, Clone, Copy)]
        struct Never;
        component!(Never);

        let mut registry = Registry::new();
        let e = registry.create();
        registry.add(e, Position(0));

        assert_eq!(registry.query().with::<Position>().with::<Never>().count(), 0);
        assert_eq!(registry.query().with::<Position>().without::<Never>().count(), 1);
        assert_eq!(registry.query().count(), 0);
    }

    #[test]
    fn test_cached_query() {
        let mut registry = Registry::new();
        let a = registry.create();
        registry.add(a, Position(1));

        let mut query = CachedQuery::new(&mut registry, &[Position::type_id()], &[Frozen::type_id()]);
        assert_eq!(query.entities(&registry), &[a]);
        assert_eq!(query.rebuilds(), 1);

        registry.add(a, Position(4));
        registry.add(a, Label(1));
        assert!(!query.is_stale());
        query.entities(&registry);
        assert_eq!(query.rebuilds(), 1);

        let b = registry.create();
        registry.add(b, Position(2));
        assert!(query.is_stale());
        assert_eq!(query.entities(&registry), &[a, b]);

        registry.add(a, Frozen);
        assert_eq!(query.entities(&registry), &[b]);

        registry.destroy(b);
        assert!(query.entities(&registry).is_empty());

        query.detach(&mut registry);
        let c = registry.create();
        registry.add(c, Position(0));
    }
}

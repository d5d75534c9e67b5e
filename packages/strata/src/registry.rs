//! The registry owns every entity and component.
//!
//! Structural changes (creating and destroying entities, attaching and
//! detaching components) require `&mut Registry`. Systems running in parallel
//! only get `&Registry`, through which they can lock individual component
//! storages with `read` and `write`, and must defer structural changes to a
//! `CommandBuffer`.

use std::fmt::{self, Debug, Formatter};

use bit_vec::BitVec;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::bridge::ComponentBridge;
use crate::component::{Component, ComponentTypeID};
use crate::config::Config;
use crate::entity::{EntityID, FreeIndexStack};
use crate::error::{Error, Result};
use crate::memory::{AlignedArray, PAGE_SIZE};
use crate::query::QueryBuilder;
use crate::snapshot::EntitySnapshot;
use crate::sparse_set::{ErasedStorage, RawStorage, SparseSet};

pub(crate) type StorageCell = RwLock<Box<dyn ErasedStorage>>;

// Returns false once the observer should be dropped.
type Observer = Box<dyn Fn(&RegistryEvent) -> bool + Send + Sync>;

/// A structural change in a `Registry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    EntityCreated(EntityID),
    EntityDestroyed(EntityID),
    ComponentAdded(EntityID, ComponentTypeID),
    ComponentRemoved(EntityID, ComponentTypeID),
    /// The registry was overwritten wholesale from a snapshot.
    Restored,
}

/// A handle to an event subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionID(u64);

/// A collection of entities and their components.
pub struct Registry {
    config: Config,
    generations: AlignedArray<u32>,
    free: FreeIndexStack,
    next_index: u32,
    alive: usize,
    retired: usize,
    storages: Vec<Option<StorageCell>>,
    observers: Vec<(SubscriptionID, Observer)>,
    next_subscription: u64,
}

impl Registry {
    /// Create a new, empty, registry with the default configuration.
    pub fn new() -> Registry {
        Registry::with_config(Config::default())
    }

    /// Create a new, empty, registry.
    pub fn with_config(config: Config) -> Registry {
        Registry {
            generations: AlignedArray::new(config.initial_entity_capacity.max(1), PAGE_SIZE, 0),
            free: FreeIndexStack::with_capacity(config.free_list_capacity),
            next_index: 0,
            alive: 0,
            retired: 0,
            storages: Vec::new(),
            observers: Vec::new(),
            next_subscription: 0,
            config,
        }
    }

    /// Return the configuration this registry was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the number of live entities.
    pub fn alive_count(&self) -> usize {
        self.alive
    }

    /// Return the number of entity indices which will never be reused.
    pub fn retired_count(&self) -> usize {
        self.retired
    }

    /// Return the number of entity indices ever handed out.
    pub fn index_count(&self) -> usize {
        self.next_index as usize
    }

    fn ensure_generation_capacity(&mut self, len: usize) {
        let capacity = self.generations.capacity();
        if len > capacity {
            self.generations.grow((capacity * 2).max(len), 0);
        }
    }

    pub(crate) fn emit(&mut self, event: RegistryEvent) {
        self.observers.retain(|(_, observer)| observer(&event));
    }

    /// Create a new entity.
    ///
    /// Recently destroyed indices are reused first.
    pub fn create(&mut self) -> EntityID {
        let index = if self.free.is_empty() {
            let index = self.next_index;
            assert!(index < u32::MAX, "entity index space exhausted");
            self.next_index += 1;
            self.ensure_generation_capacity(index as usize + 1);
            index
        } else {
            self.free.pop()
        };

        let entity = EntityID::new(index, self.generations[index as usize]);
        self.alive += 1;
        self.emit(RegistryEvent::EntityCreated(entity));
        entity
    }

    /// Destroy an entity and every component attached to it.
    ///
    /// Returns false if the handle was already invalid.
    pub fn destroy(&mut self, entity: EntityID) -> bool {
        if !self.is_valid(entity) {
            return false;
        }

        self.emit(RegistryEvent::EntityDestroyed(entity));

        for idx in 0..self.storages.len() {
            let removed = match self.storages[idx].as_mut() {
                Some(cell) => cell.get_mut().remove_entity(entity),
                None => false,
            };

            if removed {
                self.emit(RegistryEvent::ComponentRemoved(entity, ComponentTypeID::new(idx)));
            }
        }

        // An index whose generation is exhausted is never handed out again,
        // so no later handle can compare equal to an old one.
        let index = entity.index() as usize;
        self.generations[index] += 1;
        if self.generations[index] == u32::MAX {
            self.retired += 1;
            debug!(index, "retired entity index");
        } else {
            self.free.push(entity.index());
        }
        self.alive -= 1;
        true
    }

    /// Returns true if the handle refers to a live entity.
    pub fn is_valid(&self, entity: EntityID) -> bool {
        entity.index() < self.next_index
            && entity.generation() != u32::MAX
            && self.generations[entity.index() as usize] == entity.generation()
    }

    fn cell(&self, type_id: ComponentTypeID) -> Option<&StorageCell> {
        self.storages.get(type_id.id()).and_then(|s| s.as_ref())
    }

    fn get_or_create_cell(&mut self, type_id: ComponentTypeID) -> &mut StorageCell {
        let idx = type_id.id();
        if idx >= self.storages.len() {
            self.storages.resize_with(idx + 1, || None);
        }

        let capacity = self.config.initial_component_capacity;
        self.storages[idx].get_or_insert_with(|| {
            let registration = type_id.registration();
            debug!(component = registration.name(), capacity, "creating component storage");
            RwLock::new(registration.new_storage(capacity))
        })
    }

    /// Get the storage for a component type, creating it if required.
    pub fn get_or_create_storage<T: Component>(&mut self) -> &mut SparseSet<T> {
        self.get_or_create_cell(T::type_id())
            .get_mut()
            .as_any_mut()
            .downcast_mut::<SparseSet<T>>()
            .unwrap_or_else(|| panic!("storage type mismatch for {}", std::any::type_name::<T>()))
    }

    fn storage_mut<T: Component>(&mut self) -> Option<&mut SparseSet<T>> {
        self.storages.get_mut(T::type_id().id())
            .and_then(|s| s.as_mut())
            .and_then(|cell| cell.get_mut().as_any_mut().downcast_mut::<SparseSet<T>>())
    }

    /// Lock the storage for a component type for reading.
    ///
    /// Returns `None` if no component of this type has ever been added.
    pub fn read<T: Component>(&self) -> Option<MappedRwLockReadGuard<'_, SparseSet<T>>> {
        let guard = self.cell(T::type_id())?.read_recursive();
        RwLockReadGuard::try_map(guard, |s| s.as_any().downcast_ref::<SparseSet<T>>()).ok()
    }

    /// Lock the storage for a component type for writing.
    ///
    /// Returns `None` if no component of this type has ever been added.
    pub fn write<T: Component>(&self) -> Option<MappedRwLockWriteGuard<'_, SparseSet<T>>> {
        let guard = self.cell(T::type_id())?.write();
        RwLockWriteGuard::try_map(guard, |s| s.as_any_mut().downcast_mut::<SparseSet<T>>()).ok()
    }

    /// Lock a type-erased storage for reading.
    pub fn read_erased(&self, type_id: ComponentTypeID) -> Option<RwLockReadGuard<'_, Box<dyn ErasedStorage>>> {
        self.cell(type_id).map(|cell| cell.read_recursive())
    }

    /// Call `f` with the raw arrays backing a component type.
    pub fn with_raw_storage<R>(&self, type_id: ComponentTypeID, f: impl FnOnce(RawStorage<'_>) -> R) -> Option<R> {
        let guard = self.read_erased(type_id)?;
        Some(f(guard.raw()))
    }

    /// Return the component types which currently have storage.
    pub fn component_types(&self) -> Vec<ComponentTypeID> {
        self.storages.iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(idx, _)| ComponentTypeID::new(idx))
            .collect()
    }

    pub(crate) fn cells(&self) -> impl Iterator<Item = &StorageCell> + '_ {
        self.storages.iter().filter_map(|s| s.as_ref())
    }

    pub(crate) fn cells_mut(&mut self) -> impl Iterator<Item = &mut StorageCell> + '_ {
        self.storages.iter_mut().filter_map(|s| s.as_mut())
    }

    pub(crate) fn erased_storage_mut(&mut self, type_id: ComponentTypeID) -> &mut Box<dyn ErasedStorage> {
        self.get_or_create_cell(type_id).get_mut()
    }

    /// Attach a component to an entity, overwriting any existing value.
    ///
    /// Returns false if the entity is not valid.
    pub fn add<T: Component>(&mut self, entity: EntityID, value: T) -> bool {
        if !self.is_valid(entity) {
            return false;
        }

        let previous = self.get_or_create_storage::<T>().insert(entity, value);
        if previous.is_none() {
            self.emit(RegistryEvent::ComponentAdded(entity, T::type_id()));
        }

        true
    }

    /// Get a copy of the component attached to an entity.
    pub fn get<T: Component>(&self, entity: EntityID) -> Option<T> {
        if !self.is_valid(entity) {
            return None;
        }

        self.read::<T>()?.get(entity).copied()
    }

    /// Get a mutable reference to the component attached to an entity.
    pub fn get_mut<T: Component>(&mut self, entity: EntityID) -> Option<&mut T> {
        if !self.is_valid(entity) {
            return None;
        }

        self.storage_mut::<T>()?.get_mut(entity)
    }

    /// Returns true if the entity has a component of type `T`.
    pub fn has<T: Component>(&self, entity: EntityID) -> bool {
        self.is_valid(entity)
            && self.read::<T>().map_or(false, |s| s.contains(entity))
    }

    /// Detach a component from an entity, returning it.
    pub fn remove<T: Component>(&mut self, entity: EntityID) -> Option<T> {
        if !self.is_valid(entity) {
            return None;
        }

        let removed = self.storage_mut::<T>()?.remove(entity);
        if removed.is_some() {
            self.emit(RegistryEvent::ComponentRemoved(entity, T::type_id()));
        }

        removed
    }

    /// Clear the dirty flags of every storage.
    pub fn clear_all_dirty_bits(&mut self) {
        for cell in self.cells_mut() {
            cell.get_mut().clear_all_dirty();
        }
    }

    /// Start building a query over this registry.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Call `push` on the bridge for every dirty `T`, clearing the dirty flags.
    ///
    /// Returns the number of components pushed.
    pub fn push_changes<T: Component>(&mut self, bridge: &mut impl ComponentBridge<T>) -> usize {
        self.storage_mut::<T>().map_or(0, |s| crate::bridge::push_changes(s, bridge))
    }

    /// Call `pull` on the bridge for every `T`, marking changed values dirty.
    ///
    /// Returns the number of components which changed.
    pub fn pull_changes<T: Component>(&mut self, bridge: &mut impl ComponentBridge<T>) -> usize {
        self.storage_mut::<T>().map_or(0, |s| crate::bridge::pull_changes(s, bridge))
    }

    /// Subscribe to structural events.
    ///
    /// Observers are called synchronously, in subscription order.
    pub fn subscribe(&mut self, observer: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> SubscriptionID {
        self.subscribe_while(move |event| {
            observer(event);
            true
        })
    }

    /// Subscribe an observer which is dropped the first time it returns false.
    pub fn subscribe_while(&mut self, observer: impl Fn(&RegistryEvent) -> bool + Send + Sync + 'static) -> SubscriptionID {
        let id = SubscriptionID(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Return the number of live subscriptions.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Remove a subscription, returning false if it did not exist.
    pub fn unsubscribe(&mut self, id: SubscriptionID) -> bool {
        match self.observers.iter().position(|(x, _)| *x == id) {
            Some(idx) => {
                self.observers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Verify the internal invariants of the registry and every storage.
    pub fn audit(&self) -> Result<()> {
        let fail = |detail: String| -> Result<()> {
            Err(Error::Integrity {
                component: "Registry",
                detail,
            })
        };

        if self.generations.capacity() < self.next_index as usize {
            return fail(format!("generation table holds {} of {} indices", self.generations.capacity(), self.next_index));
        }

        let mut freed = BitVec::from_elem(self.next_index as usize, false);
        for &index in self.free.as_slice() {
            if index >= self.next_index {
                return fail(format!("free index {} was never allocated", index));
            }
            if freed.get(index as usize).unwrap_or(false) {
                return fail(format!("index {} is free more than once", index));
            }
            if self.generations[index as usize] == u32::MAX {
                return fail(format!("retired index {} is free", index));
            }
            freed.set(index as usize, true);
        }

        if self.alive + self.free.len() + self.retired != self.next_index as usize {
            return fail(format!(
                "{} live, {} free and {} retired entities for {} indices",
                self.alive, self.free.len(), self.retired, self.next_index,
            ));
        }

        for cell in self.cells() {
            let storage = cell.read_recursive();
            storage.check_integrity()?;

            for slot in 0..storage.len() {
                match storage.entity_at(slot) {
                    Some(entity) if self.is_valid(entity) => {}
                    entity => return Err(Error::Integrity {
                        component: storage.type_name(),
                        detail: format!("slot {} belongs to dead entity {:?}", slot, entity),
                    }),
                }
            }
        }

        Ok(())
    }

    /// Copy the entity bookkeeping.
    pub(crate) fn entity_state(&self) -> EntitySnapshot {
        EntitySnapshot::new(
            self.generations[..self.next_index as usize].to_vec(),
            self.free.as_slice().to_vec(),
            self.next_index,
        )
    }

    /// Overwrite the entity bookkeeping.
    pub(crate) fn restore_entity_state(&mut self, state: &EntitySnapshot) {
        let generations = state.generations();
        self.ensure_generation_capacity(generations.len());
        self.generations[..generations.len()].copy_from_slice(generations);
        self.generations[generations.len()..].fill(0);
        self.free.assign(state.free());
        self.next_index = state.next_index();
        self.retired = generations.iter().filter(|g| **g == u32::MAX).count();
        self.alive = self.next_index as usize - self.free.len() - self.retired;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("alive", &self.alive)
            .field("indices", &self.next_index)
            .field("component_types", &self.component_types())
            .finish()
    }
}

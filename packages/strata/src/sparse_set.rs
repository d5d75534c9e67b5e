//! Sparse-set component storage.
//!
//! Each component type gets one `SparseSet`. The sparse array maps entity
//! indices to slots in the dense array, and the dense array holds the owning
//! entity of each slot. The component values themselves live in a
//! `ChunkedStorage` at the same slot as their entity, so they are packed
//! without holes. Removal swaps the last slot into the hole.
//!
//! Two bitsets ride alongside: `presence` (one bit per entity index, used for
//! joins) and `dirty` (one bit per dense slot, set whenever a value is written
//! through `insert`).

use std::any::{self, type_name};
use std::fmt::{self, Debug, Formatter};

use bit_vec::BitVec;

use crate::chunked::ChunkedStorage;
use crate::component::{Component, ComponentTypeID};
use crate::entity::EntityID;
use crate::error::{Error, Result};
use crate::join::{set_bits, LANE_WORDS};
use crate::memory::{AlignedArray, AlignedBlock, CACHE_LINE};
use crate::snapshot::StorageSnapshot;

/// The sparse array value for an entity index with no component.
pub const ABSENT: u32 = u32::MAX;

/// A borrowed view of the raw arrays backing a storage.
///
/// This is used by bulk consumers (joins, snapshots and external vectorised
/// code) which want to work on the arrays directly rather than via entities.
#[derive(Clone, Copy)]
pub struct RawStorage<'a> {
    /// The component type stored.
    pub type_id: ComponentTypeID,
    /// The packed owner of every occupied slot.
    pub dense: &'a [EntityID],
    /// The slot for every entity index, or `ABSENT`.
    pub sparse: &'a [u32],
    /// The dirty bitset words, one bit per dense slot.
    pub dirty_words: &'a [u32],
    /// The number of valid bits in `dirty_words`.
    pub dirty_bits: usize,
    /// The presence bitset words, one bit per entity index.
    pub presence_words: &'a [u32],
    /// The number of valid bits in `presence_words`.
    pub presence_bits: usize,
    /// The component blocks.
    pub blocks: &'a [AlignedBlock],
    /// The number of components per block.
    pub elements_per_block: usize,
}

/// Dense storage for one component type.
pub struct SparseSet<T: Component> {
    sparse: AlignedArray<u32>,
    dense: AlignedArray<EntityID>,
    len: usize,
    components: ChunkedStorage<T>,
    presence: BitVec<u32>,
    dirty: BitVec<u32>,
    version: u64,
}

impl<T: Component> SparseSet<T> {
    /// Create a new, empty, sparse set.
    pub fn new() -> SparseSet<T> {
        SparseSet::with_capacity(0)
    }

    /// Create a new sparse set with room for `capacity` entities.
    pub fn with_capacity(capacity: usize) -> SparseSet<T> {
        let sparse = AlignedArray::new(capacity, CACHE_LINE, ABSENT);
        let dense = AlignedArray::new(capacity, CACHE_LINE, EntityID::NULL);
        let mut components = ChunkedStorage::new();
        components.reserve(capacity);

        SparseSet {
            sparse,
            dense,
            len: 0,
            components,
            presence: BitVec::from_elem(capacity, false),
            dirty: BitVec::from_elem(capacity, false),
            version: 0,
        }
    }

    /// Return the number of components stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no components are stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the dense capacity.
    pub fn capacity(&self) -> usize {
        self.dense.capacity()
    }

    /// Return the structural version of this set.
    ///
    /// The version is bumped whenever an entity joins or leaves the set, but
    /// not when a value is overwritten.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Return the slot used by the given entity index, if any.
    pub fn slot_of_index(&self, index: usize) -> Option<usize> {
        match self.sparse.get(index) {
            Some(&slot) if slot != ABSENT => Some(slot as usize),
            _ => None,
        }
    }

    /// Return the slot used by the given entity, if any.
    pub fn slot_of(&self, entity: EntityID) -> Option<usize> {
        if entity.is_null() {
            return None;
        }

        self.slot_of_index(entity.index() as usize)
            .filter(|slot| self.dense[*slot] == entity)
    }

    /// Returns true if the given entity has a component in this set.
    pub fn contains(&self, entity: EntityID) -> bool {
        self.slot_of(entity).is_some()
    }

    /// Returns true if the presence bit is set for the given entity index.
    pub fn has_presence(&self, index: usize) -> bool {
        self.presence.get(index).unwrap_or(false)
    }

    fn ensure_sparse(&mut self, index: usize) {
        let capacity = self.sparse.capacity();
        if index < capacity {
            return;
        }

        let new_capacity = (capacity * 2).max(index + 1);
        self.sparse.grow(new_capacity, ABSENT);
        self.presence.grow(new_capacity - self.presence.len(), false);
    }

    fn ensure_dense(&mut self, len: usize) {
        let capacity = self.dense.capacity();
        if len <= capacity {
            return;
        }

        let new_capacity = (capacity * 2).max(len);
        self.dense.grow(new_capacity, EntityID::NULL);
        self.dirty.grow(new_capacity - self.dirty.len(), false);
    }

    /// Insert a component for the given entity.
    ///
    /// If the entity already has a component, it is overwritten in place, marked
    /// dirty and the previous value is returned. If the entity index is occupied
    /// by a stale generation, that stale entry is removed first.
    pub fn insert(&mut self, entity: EntityID, value: T) -> Option<T> {
        if entity.is_null() {
            return None;
        }

        let index = entity.index() as usize;
        if let Some(slot) = self.slot_of_index(index) {
            if self.dense[slot] == entity {
                self.dirty.set(slot, true);
                return self.components.get_mut(slot)
                    .map(|existing| std::mem::replace(existing, value));
            }

            self.remove_slot(slot);
        }

        self.ensure_sparse(index);
        self.ensure_dense(self.len + 1);

        let slot = self.len;
        self.components.push(value);
        self.dense[slot] = entity;
        self.sparse[index] = slot as u32;
        self.presence.set(index, true);
        self.dirty.set(slot, true);
        self.len += 1;
        self.version += 1;
        None
    }

    /// Remove the component for the given entity, returning it.
    pub fn remove(&mut self, entity: EntityID) -> Option<T> {
        let slot = self.slot_of(entity)?;
        Some(self.remove_slot(slot))
    }

    /// Remove the component in the given slot by swapping in the last slot.
    fn remove_slot(&mut self, slot: usize) -> T {
        let last = self.len - 1;
        let removed = self.dense[slot];
        let value = self.components.swap_remove(slot);

        if slot != last {
            let moved = self.dense[last];
            let moved_dirty = self.dirty[last];
            self.dense[slot] = moved;
            self.sparse[moved.index() as usize] = slot as u32;
            self.dirty.set(slot, moved_dirty);
        }

        self.dense[last] = EntityID::NULL;
        self.dirty.set(last, false);
        self.sparse[removed.index() as usize] = ABSENT;
        self.presence.set(removed.index() as usize, false);
        self.len = last;
        self.version += 1;
        value
    }

    /// Remove every component.
    pub fn clear(&mut self) {
        for slot in 0..self.len {
            let index = self.dense[slot].index() as usize;
            self.sparse[index] = ABSENT;
            self.presence.set(index, false);
            self.dense[slot] = EntityID::NULL;
        }

        self.dirty.clear();
        self.components.truncate(0);
        self.len = 0;
        self.version += 1;
    }

    /// Get the component for an entity.
    pub fn get(&self, entity: EntityID) -> Option<&T> {
        self.slot_of(entity).and_then(|slot| self.components.get(slot))
    }

    /// Get the component for an entity mutably.
    ///
    /// Writing through this reference does not mark the slot dirty.
    pub fn get_mut(&mut self, entity: EntityID) -> Option<&mut T> {
        let slot = self.slot_of(entity)?;
        self.components.get_mut(slot)
    }

    /// Get the component for an entity index, ignoring the generation.
    pub fn get_by_index(&self, index: usize) -> Option<&T> {
        self.slot_of_index(index).and_then(|slot| self.components.get(slot))
    }

    /// Get the component for an entity index mutably, ignoring the generation.
    pub fn get_by_index_mut(&mut self, index: usize) -> Option<&mut T> {
        let slot = self.slot_of_index(index)?;
        self.components.get_mut(slot)
    }

    /// Return the entity stored in a dense slot.
    pub fn entity_at(&self, slot: usize) -> Option<EntityID> {
        if slot < self.len {
            Some(self.dense[slot])
        } else {
            None
        }
    }

    /// Return the component stored in a dense slot.
    pub fn component_at(&self, slot: usize) -> Option<&T> {
        self.components.get(slot)
    }

    /// Return the component stored in a dense slot mutably.
    pub fn component_at_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.components.get_mut(slot)
    }

    /// Return the address of the component stored in a dense slot.
    ///
    /// This is stable until the component is removed or moved by a removal.
    pub fn address_at(&self, slot: usize) -> Option<*const T> {
        self.components.address_of(slot)
    }

    /// Returns true if the given slot is marked dirty.
    pub fn is_dirty(&self, slot: usize) -> bool {
        slot < self.len && self.dirty.get(slot).unwrap_or(false)
    }

    /// Mark a slot dirty. Out of range slots are ignored.
    pub fn set_dirty(&mut self, slot: usize) {
        if slot < self.len {
            self.dirty.set(slot, true);
        }
    }

    /// Clear the dirty flag on a slot. Out of range slots are ignored.
    pub fn clear_dirty(&mut self, slot: usize) {
        if slot < self.len {
            self.dirty.set(slot, false);
        }
    }

    /// Mark the component of an entity dirty, returning false if it has none.
    pub fn mark_dirty(&mut self, entity: EntityID) -> bool {
        match self.slot_of(entity) {
            Some(slot) => {
                self.dirty.set(slot, true);
                true
            }
            None => false,
        }
    }

    /// Clear every dirty flag.
    pub fn clear_all_dirty(&mut self) {
        // Clearing whole words never touches bits beyond the logical length.
        let words = unsafe { self.dirty.storage_mut() };
        let mut lanes = words.chunks_exact_mut(LANE_WORDS);
        for lane in &mut lanes {
            lane.copy_from_slice(&[0; LANE_WORDS]);
        }
        for word in lanes.into_remainder() {
            *word = 0;
        }
    }

    /// Return the number of dirty slots.
    pub fn dirty_count(&self) -> usize {
        self.dirty.storage().iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the dirty slots.
    pub fn iter_dirty(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.len;
        set_bits(self.dirty.storage()).take_while(move |slot| *slot < len)
    }

    /// Iterate over every entity and its component.
    pub fn iter(&self) -> impl Iterator<Item = (EntityID, &T)> + '_ {
        self.dense[..self.len].iter().copied().zip(self.components.iter())
    }

    /// Iterate mutably over every entity and its component.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityID, &mut T)> + '_ {
        self.dense[..self.len].iter().copied().zip(self.components.iter_mut())
    }

    /// Return the occupied part of the dense array.
    pub fn dense(&self) -> &[EntityID] {
        &self.dense[..self.len]
    }

    /// Return the whole sparse array.
    pub fn sparse(&self) -> &[u32] {
        &self.sparse
    }

    /// Return the dirty bitset words.
    pub fn dirty_words(&self) -> &[u32] {
        self.dirty.storage()
    }

    /// Return the presence bitset words.
    pub fn presence_words(&self) -> &[u32] {
        self.presence.storage()
    }

    /// Return the component blocks.
    pub fn blocks(&self) -> &[AlignedBlock] {
        self.components.blocks()
    }

    /// Borrow the raw arrays backing this set.
    pub fn raw(&self) -> RawStorage<'_> {
        RawStorage {
            type_id: T::type_id(),
            dense: self.dense(),
            sparse: self.sparse(),
            dirty_words: self.dirty_words(),
            dirty_bits: self.dirty.len(),
            presence_words: self.presence_words(),
            presence_bits: self.presence.len(),
            blocks: self.blocks(),
            elements_per_block: self.components.elements_per_block(),
        }
    }

    /// Copy the arrays backing this set.
    pub fn capture(&self, is_delta: bool) -> StorageSnapshot {
        StorageSnapshot::new(
            T::type_id(),
            type_name::<T>(),
            self.dense().to_vec(),
            self.sparse().to_vec(),
            self.blocks().to_vec(),
            self.dirty_words().to_vec(),
            self.dirty.len(),
            is_delta,
        )
    }

    /// Restore the arrays backing this set from a snapshot.
    ///
    /// A full restore replaces the dense and sparse arrays and rebuilds the
    /// presence bits from them. Both kinds of restore copy every component
    /// block and the dirty bits verbatim.
    pub fn restore(&mut self, snapshot: &StorageSnapshot, full: bool) {
        if full {
            let dense = snapshot.dense();
            self.ensure_dense(dense.len());
            self.dense[..dense.len()].copy_from_slice(dense);
            self.dense[dense.len()..].fill(EntityID::NULL);
            self.len = dense.len();

            let sparse = snapshot.sparse();
            self.ensure_sparse(sparse.len().saturating_sub(1));
            self.sparse[..sparse.len()].copy_from_slice(sparse);
            self.sparse[sparse.len()..].fill(ABSENT);

            self.presence.clear();
            for entity in &self.dense[..self.len] {
                self.presence.set(entity.index() as usize, true);
            }

            self.components.restore_blocks(snapshot.blocks(), self.len);
            self.version += 1;
        } else {
            self.components.overwrite_blocks(snapshot.blocks());
        }

        // Only bits for occupied slots are carried over.
        self.dirty.clear();
        let len = self.len;
        for slot in set_bits(snapshot.dirty_words()).take_while(|slot| *slot < len) {
            self.dirty.set(slot, true);
        }
    }

    /// Verify the internal invariants of this set.
    pub fn check_integrity(&self) -> Result<()> {
        let fail = |detail: String| -> Result<()> {
            Err(Error::Integrity {
                component: type_name::<T>(),
                detail,
            })
        };

        if self.components.len() != self.len {
            return fail(format!("{} components stored for {} entities", self.components.len(), self.len));
        }

        if self.presence.len() != self.sparse.capacity() {
            return fail(format!("presence holds {} bits for {} sparse entries", self.presence.len(), self.sparse.capacity()));
        }

        for (slot, entity) in self.dense().iter().enumerate() {
            if entity.is_null() {
                return fail(format!("slot {} holds the null entity", slot));
            }

            let index = entity.index() as usize;
            if self.sparse.get(index).copied() != Some(slot as u32) {
                return fail(format!("{:?} in slot {} is not indexed by the sparse array", entity, slot));
            }

            if !self.has_presence(index) {
                return fail(format!("{:?} in slot {} has no presence bit", entity, slot));
            }
        }

        let present = self.presence.storage().iter().map(|w| w.count_ones() as usize).sum::<usize>();
        if present != self.len {
            return fail(format!("{} presence bits set for {} entities", present, self.len));
        }

        if let Some(slot) = set_bits(self.dirty.storage()).find(|slot| *slot >= self.len) {
            return fail(format!("unoccupied slot {} is dirty", slot));
        }

        Ok(())
    }
}

impl<T: Component> Default for SparseSet<T> {
    fn default() -> Self {
        SparseSet::new()
    }
}

impl<T: Component> Debug for SparseSet<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// The type-erased interface to a `SparseSet`.
///
/// The registry keeps one of these per component type and downcasts to the
/// concrete `SparseSet<T>` for typed access.
pub trait ErasedStorage: any::Any + Send + Sync {
    /// Return the component type stored.
    fn component_type(&self) -> ComponentTypeID;

    /// Return the name of the component type stored.
    fn type_name(&self) -> &'static str;

    /// Return the number of components stored.
    fn len(&self) -> usize;

    /// Returns true if the entity has a component in this storage.
    fn contains(&self, entity: EntityID) -> bool;

    /// Return the entity stored in a dense slot.
    fn entity_at(&self, slot: usize) -> Option<EntityID>;

    /// Remove the component of an entity, returning true if there was one.
    fn remove_entity(&mut self, entity: EntityID) -> bool;

    /// Remove every component.
    fn clear(&mut self);

    /// Clear every dirty flag.
    fn clear_all_dirty(&mut self);

    /// Return the structural version.
    fn version(&self) -> u64;

    /// Borrow the raw arrays.
    fn raw(&self) -> RawStorage<'_>;

    /// Copy the raw arrays.
    fn capture(&self, is_delta: bool) -> StorageSnapshot;

    /// Restore the raw arrays.
    fn restore(&mut self, snapshot: &StorageSnapshot, full: bool);

    /// Verify the internal invariants.
    fn check_integrity(&self) -> Result<()>;

    fn as_any(&self) -> &dyn any::Any;

    fn as_any_mut(&mut self) -> &mut dyn any::Any;
}

impl<T: Component> ErasedStorage for SparseSet<T> {
    fn component_type(&self) -> ComponentTypeID {
        T::type_id()
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn contains(&self, entity: EntityID) -> bool {
        SparseSet::contains(self, entity)
    }

    fn entity_at(&self, slot: usize) -> Option<EntityID> {
        SparseSet::entity_at(self, slot)
    }

    fn remove_entity(&mut self, entity: EntityID) -> bool {
        self.remove(entity).is_some()
    }

    fn clear(&mut self) {
        SparseSet::clear(self)
    }

    fn clear_all_dirty(&mut self) {
        SparseSet::clear_all_dirty(self)
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn raw(&self) -> RawStorage<'_> {
        SparseSet::raw(self)
    }

    fn capture(&self, is_delta: bool) -> StorageSnapshot {
        SparseSet::capture(self, is_delta)
    }

    fn restore(&mut self, snapshot: &StorageSnapshot, full: bool) {
        SparseSet::restore(self, snapshot, full)
    }

    fn check_integrity(&self) -> Result<()> {
        SparseSet::check_integrity(self)
    }

    fn as_any(&self) -> &dyn any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn any::Any {
        self
    }
}

//! Frame snapshots.
//!
//! A snapshot is an owned copy of every component storage's raw arrays (dense,
//! sparse, dirty and presence bits, and whole component blocks) together with
//! the entity bookkeeping. The `SnapshotManager` keeps a bounded history of
//! these, evicting the oldest once the history is full.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::component::ComponentTypeID;
use crate::config::Config;
use crate::entity::EntityID;
use crate::memory::AlignedBlock;
use crate::registry::{Registry, RegistryEvent};

/// An owned copy of the raw arrays backing one component storage.
#[derive(Clone)]
pub struct StorageSnapshot {
    type_id: ComponentTypeID,
    type_name: &'static str,
    dense: Vec<EntityID>,
    sparse: Vec<u32>,
    blocks: Vec<AlignedBlock>,
    dirty: Vec<u32>,
    dirty_bits: usize,
    is_delta: bool,
}

impl StorageSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        type_id: ComponentTypeID,
        type_name: &'static str,
        dense: Vec<EntityID>,
        sparse: Vec<u32>,
        blocks: Vec<AlignedBlock>,
        dirty: Vec<u32>,
        dirty_bits: usize,
        is_delta: bool,
    ) -> StorageSnapshot {
        StorageSnapshot {
            type_id,
            type_name,
            dense,
            sparse,
            blocks,
            dirty,
            dirty_bits,
            is_delta,
        }
    }

    /// Return the component type captured.
    pub fn type_id(&self) -> ComponentTypeID {
        self.type_id
    }

    /// Return the name of the component type captured.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Return the captured dense array.
    pub fn dense(&self) -> &[EntityID] {
        &self.dense
    }

    /// Return the number of captured dense entries.
    pub fn dense_count(&self) -> usize {
        self.dense.len()
    }

    /// Return the captured sparse array.
    pub fn sparse(&self) -> &[u32] {
        &self.sparse
    }

    /// Return the capacity of the captured sparse array.
    pub fn sparse_capacity(&self) -> usize {
        self.sparse.len()
    }

    /// Return the captured component blocks.
    pub fn blocks(&self) -> &[AlignedBlock] {
        &self.blocks
    }

    /// Return the number of captured component blocks.
    pub fn chunk_count(&self) -> usize {
        self.blocks.len()
    }

    /// Return the captured dirty bitset words.
    pub fn dirty_words(&self) -> &[u32] {
        &self.dirty
    }

    /// Return the number of bits in the captured dirty bitset.
    pub fn dirty_bits_count(&self) -> usize {
        self.dirty_bits
    }

    /// Returns true if this was captured as part of a delta frame.
    pub fn is_delta(&self) -> bool {
        self.is_delta
    }
}

impl Debug for StorageSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSnapshot")
            .field("type", &self.type_name)
            .field("dense_count", &self.dense.len())
            .field("chunk_count", &self.blocks.len())
            .field("is_delta", &self.is_delta)
            .finish()
    }
}

/// An owned copy of the registry's entity bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntitySnapshot {
    generations: Vec<u32>,
    free: Vec<u32>,
    next_index: u32,
}

impl EntitySnapshot {
    pub(crate) fn new(generations: Vec<u32>, free: Vec<u32>, next_index: u32) -> EntitySnapshot {
        EntitySnapshot {
            generations,
            free,
            next_index,
        }
    }

    /// Return the generation of every allocated entity index.
    pub fn generations(&self) -> &[u32] {
        &self.generations
    }

    /// Return the recycled indices, oldest first.
    pub fn free(&self) -> &[u32] {
        &self.free
    }

    /// Return the next unallocated entity index.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }
}

/// A captured frame.
#[derive(Clone, Debug)]
pub struct Snapshot {
    frame: u64,
    is_delta: bool,
    entities: EntitySnapshot,
    storages: Vec<StorageSnapshot>,
}

impl Snapshot {
    /// Capture the current state of a registry.
    ///
    /// Storages are copied in parallel.
    pub fn capture(registry: &Registry, frame: u64, is_delta: bool) -> Snapshot {
        let cells: Vec<_> = registry.cells().collect();
        let storages = cells.par_iter()
            .map(|cell| cell.read_recursive().capture(is_delta))
            .collect::<Vec<_>>();
        debug!(frame, is_delta, storages = storages.len(), "captured snapshot");

        Snapshot {
            frame,
            is_delta,
            entities: registry.entity_state(),
            storages,
        }
    }

    /// Return the frame number this snapshot was recorded as.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Returns true if this is a delta snapshot.
    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    /// Return the captured entity bookkeeping.
    pub fn entities(&self) -> &EntitySnapshot {
        &self.entities
    }

    /// Return the captured storages.
    pub fn storages(&self) -> &[StorageSnapshot] {
        &self.storages
    }

    /// Return the captured storage for a component type.
    pub fn storage(&self, type_id: ComponentTypeID) -> Option<&StorageSnapshot> {
        self.storages.iter().find(|s| s.type_id == type_id)
    }

    /// Write this snapshot back into a registry.
    ///
    /// A full snapshot replaces the entity bookkeeping and every storage's
    /// dense and sparse arrays; storages which were not captured are emptied.
    /// Both kinds of snapshot copy every component block and the dirty bits.
    /// Observers are sent `RegistryEvent::Restored` afterwards.
    pub fn restore(&self, registry: &mut Registry) {
        let full = !self.is_delta;

        if full {
            registry.restore_entity_state(&self.entities);

            for cell in registry.cells_mut() {
                let storage = cell.get_mut();
                if self.storage(storage.component_type()).is_none() {
                    storage.clear();
                }
            }
        }

        for snapshot in self.storages.iter() {
            registry.erased_storage_mut(snapshot.type_id).restore(snapshot, full);
        }
        registry.emit(RegistryEvent::Restored);

        debug!(frame = self.frame, full, storages = self.storages.len(), "restored snapshot");
    }
}

/// A bounded history of frame snapshots.
pub struct SnapshotManager {
    history: VecDeque<Snapshot>,
    max_history_frames: usize,
    next_frame: u64,
}

impl SnapshotManager {
    /// Create a new snapshot manager which keeps up to `max_history_frames`.
    pub fn new(max_history_frames: usize) -> SnapshotManager {
        SnapshotManager {
            history: VecDeque::with_capacity(max_history_frames.min(1024)),
            max_history_frames,
            next_frame: 0,
        }
    }

    /// Create a new snapshot manager from a configuration.
    pub fn with_config(config: &Config) -> SnapshotManager {
        SnapshotManager::new(config.max_history_frames)
    }

    /// Return the maximum number of snapshots kept.
    pub fn max_history_frames(&self) -> usize {
        self.max_history_frames
    }

    /// Return the number of snapshots kept.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns true if there are no snapshots.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Iterate over the history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        self.history.iter()
    }

    /// Return the most recent snapshot.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.history.back()
    }

    /// Return the snapshot recorded as the given frame, if it is still kept.
    pub fn frame(&self, frame: u64) -> Option<&Snapshot> {
        self.history.iter().find(|s| s.frame == frame)
    }

    /// Capture a snapshot without recording it.
    pub fn create_snapshot(&self, registry: &Registry, delta_only: bool) -> Snapshot {
        Snapshot::capture(registry, self.next_frame, delta_only)
    }

    /// Capture a snapshot and add it to the history, returning its frame number.
    ///
    /// When `delta_only` is set, the registry's dirty bits are cleared after
    /// capture, so the next frame's dirty bits only describe later changes.
    pub fn record_frame(&mut self, registry: &mut Registry, delta_only: bool) -> u64 {
        let snapshot = self.create_snapshot(registry, delta_only);
        let frame = snapshot.frame;
        self.next_frame += 1;

        if delta_only {
            registry.clear_all_dirty_bits();
        }

        self.history.push_back(snapshot);
        while self.history.len() > self.max_history_frames {
            if let Some(evicted) = self.history.pop_front() {
                trace!(frame = evicted.frame, "evicted snapshot");
            }
        }

        frame
    }

    /// Write a snapshot back into a registry.
    pub fn load_snapshot(&self, registry: &mut Registry, snapshot: &Snapshot) {
        snapshot.restore(registry);
    }

    /// Drop every snapshot.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        SnapshotManager::with_config(&Config::default())
    }
}

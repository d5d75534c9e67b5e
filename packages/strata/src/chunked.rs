//! Pointer-stable storage for component values.
//!
//! Values are packed into fixed-size 16 KiB blocks, each with a reserved
//! header. Growing the storage only ever adds blocks, so once a value has been
//! written, its address does not change until it is removed.

use std::any::type_name;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;

use crate::memory::{AlignedBlock, BLOCK_HEADER_SIZE, BLOCK_SIZE, CACHE_LINE};

/// A growable array of `T` stored in fixed-size aligned blocks.
pub struct ChunkedStorage<T> {
    blocks: Vec<AlignedBlock>,
    len: usize,
    per_block: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> ChunkedStorage<T> {
    /// Create a new, empty, storage.
    ///
    /// Panics if `T` cannot be stored in a block: either its alignment exceeds
    /// a cache line, or a single value does not fit.
    pub fn new() -> ChunkedStorage<T> {
        assert!(
            std::mem::align_of::<T>() <= CACHE_LINE,
            "component type {} is aligned to {} bytes, the maximum is {}",
            type_name::<T>(), std::mem::align_of::<T>(), CACHE_LINE,
        );

        // Zero-sized values still occupy a slot for the block arithmetic.
        let stride = std::mem::size_of::<T>().max(1);
        let per_block = (BLOCK_SIZE - BLOCK_HEADER_SIZE) / stride;
        assert!(
            per_block > 0,
            "component type {} ({} bytes) does not fit in a {} byte block",
            type_name::<T>(), stride, BLOCK_SIZE,
        );

        ChunkedStorage {
            blocks: Vec::new(),
            len: 0,
            per_block,
            _marker: PhantomData,
        }
    }

    /// Return the number of values in the storage.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the number of values which fit without allocating another block.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.per_block
    }

    /// Return the number of values which fit into a single block.
    pub fn elements_per_block(&self) -> usize {
        self.per_block
    }

    /// Return the number of allocated blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Return the allocated blocks.
    pub fn blocks(&self) -> &[AlignedBlock] {
        &self.blocks
    }

    /// Append whole blocks until the capacity is at least `capacity`.
    pub fn reserve(&mut self, capacity: usize) {
        while self.capacity() < capacity {
            self.blocks.push(AlignedBlock::new(BLOCK_SIZE, CACHE_LINE));
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        let block = index / self.per_block;
        let offset = index % self.per_block;
        let base = self.blocks[block].as_ptr() as *mut u8;
        unsafe { base.add(BLOCK_HEADER_SIZE + offset * std::mem::size_of::<T>()) as *mut T }
    }

    /// Append a value, returning its index.
    pub fn push(&mut self, value: T) -> usize {
        let index = self.len;
        self.reserve(index + 1);
        unsafe { self.slot_ptr(index).write(value) };
        self.len += 1;
        index
    }

    /// Return the address of the value at `index`.
    ///
    /// The address remains the same for as long as the value is not removed,
    /// regardless of how many values are appended afterwards.
    pub fn address_of(&self, index: usize) -> Option<*const T> {
        if index < self.len {
            Some(self.slot_ptr(index) as *const T)
        } else {
            None
        }
    }

    /// Get a reference to the value at `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.len {
            Some(unsafe { &*self.slot_ptr(index) })
        } else {
            None
        }
    }

    /// Get a mutable reference to the value at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index < self.len {
            Some(unsafe { &mut *self.slot_ptr(index) })
        } else {
            None
        }
    }

    /// Remove the value at `index`, moving the last value into its place.
    pub fn swap_remove(&mut self, index: usize) -> T {
        assert!(index < self.len, "swap_remove index {} out of bounds ({})", index, self.len);

        let last = self.len - 1;
        let removed = unsafe { self.slot_ptr(index).read() };
        if index != last {
            unsafe {
                let moved = self.slot_ptr(last).read();
                self.slot_ptr(index).write(moved);
            }
        }

        self.len = last;
        removed
    }

    /// Shorten the storage to `len` values. Blocks are retained.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Iterate over all of the values in order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let per_block = self.per_block;
        let len = self.len;
        self.blocks.iter().enumerate().flat_map(move |(idx, block)| {
            let count = len.saturating_sub(idx * per_block).min(per_block);
            unsafe {
                let first = block.as_ptr().add(BLOCK_HEADER_SIZE) as *const T;
                std::slice::from_raw_parts(first, count).iter()
            }
        })
    }

    /// Iterate mutably over all of the values in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        let per_block = self.per_block;
        let len = self.len;
        self.blocks.iter_mut().enumerate().flat_map(move |(idx, block)| {
            let count = len.saturating_sub(idx * per_block).min(per_block);
            unsafe {
                let first = block.as_mut_ptr().add(BLOCK_HEADER_SIZE) as *mut T;
                std::slice::from_raw_parts_mut(first, count).iter_mut()
            }
        })
    }

    /// Overwrite the storage with copies of `blocks` holding `len` values.
    ///
    /// Block contents are copied byte for byte; the block list is grown or
    /// shrunk to match.
    pub fn restore_blocks(&mut self, blocks: &[AlignedBlock], len: usize) {
        assert!(len <= blocks.len() * self.per_block, "restored length exceeds restored blocks");

        self.blocks.truncate(blocks.len());
        for (dst, src) in self.blocks.iter_mut().zip(blocks) {
            dst.copy_from(src);
        }
        for src in &blocks[self.blocks.len()..] {
            self.blocks.push(src.clone());
        }

        self.len = len;
    }

    /// Overwrite the leading blocks with copies of `blocks`, keeping the
    /// current length. Blocks beyond the current block list are ignored.
    pub fn overwrite_blocks(&mut self, blocks: &[AlignedBlock]) {
        for (dst, src) in self.blocks.iter_mut().zip(blocks) {
            dst.copy_from(src);
        }
    }
}

impl<T: Copy> Default for ChunkedStorage<T> {
    fn default() -> Self {
        ChunkedStorage::new()
    }
}

impl<T: Copy + Debug> Debug for ChunkedStorage<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_elements_per_block() {
        let storage = ChunkedStorage::<u64>::new();
        assert_eq!(storage.elements_per_block(), (16384 - 64) / 8);

        let storage = ChunkedStorage::<[u8; 3]>::new();
        assert_eq!(storage.elements_per_block(), (16384 - 64) / 3);
    }

    #[test]
    fn test_pointer_stability() {
        let mut storage = ChunkedStorage::<u64>::new();
        storage.push(42);
        let addr = storage.address_of(0).unwrap();

        for i in 0..10_000 {
            storage.push(i);
        }

        assert!(storage.block_count() > 1);
        assert_eq!(storage.address_of(0).unwrap(), addr);
        assert_eq!(unsafe { *addr }, 42);
        assert_eq!(addr as usize % 8, 0);
    }

    #[test]
    fn test_block_boundary() {
        let mut storage = ChunkedStorage::<u32>::new();
        let per_block = storage.elements_per_block();
        for i in 0..(per_block as u32 + 2) {
            storage.push(i);
        }

        assert_eq!(storage.block_count(), 2);
        assert_eq!(storage.get(per_block), Some(&(per_block as u32)));
        assert_eq!(storage.iter().count(), per_block + 2);
        assert_eq!(storage.get(per_block + 2), None);
    }

    #[test]
    fn test_swap_remove() {
        let mut storage = ChunkedStorage::<u32>::new();
        storage.push(1);
        storage.push(2);
        storage.push(3);

        assert_eq!(storage.swap_remove(0), 1);
        assert_eq!(storage.iter().copied().collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(storage.swap_remove(1), 2);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_zero_sized() {
        #[derive(Clone, Copy)]
        struct Tag;

        let mut storage = ChunkedStorage::<Tag>::new();
        storage.push(Tag);
        storage.push(Tag);
        assert_eq!(storage.iter().count(), 2);
        assert!(storage.get(1).is_some());
    }

    #[test]
    #[should_panic(expected = "aligned to")]
    fn test_overaligned() {
        #[derive(Clone, Copy)]
        #[repr(align(128))]
        struct Wide(u8);

        ChunkedStorage::<Wide>::new();
    }

    #[test]
    fn test_restore_blocks() {
        let mut a = ChunkedStorage::<u32>::new();
        a.push(5);
        a.push(6);

        let mut b = ChunkedStorage::<u32>::new();
        b.push(1);
        b.restore_blocks(a.blocks(), a.len());
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![5, 6]);
    }
}

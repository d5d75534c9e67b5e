//! Aligned memory management.
//!
//! All of the large buffers in this crate (entity generation tables, sparse and
//! dense index arrays and component blocks) are allocated through this module
//! so their alignment is explicit. Allocation failure is never recovered from:
//! it is routed to `std::alloc::handle_alloc_error`.

use std::alloc::{self, Layout};
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use bytemuck::Pod;

/// Alignment used for per-record index arrays.
pub const CACHE_LINE: usize = 64;

/// Alignment used for large, monotonically growing tables.
pub const PAGE_SIZE: usize = 4096;

/// The size of a single component block.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// The number of bytes reserved at the start of every component block.
pub const BLOCK_HEADER_SIZE: usize = 64;

fn layout_for(size: usize, align: usize) -> Layout {
    // Zero-sized requests still get a real allocation so every pointer handed
    // out here can be passed back to `free`.
    match Layout::from_size_align(size.max(1), align) {
        Ok(layout) => layout,
        Err(_) => panic!("invalid allocation request: {} bytes aligned to {}", size, align),
    }
}

/// Return the byte size of an array of `capacity` values of `T`.
///
/// Panics if the size does not fit in an allocation.
pub fn array_size<T>(capacity: usize) -> usize {
    match Layout::array::<T>(capacity) {
        Ok(layout) => layout.size(),
        Err(_) => panic!(
            "allocation of {} x {} byte values overflows the address space",
            capacity, std::mem::size_of::<T>(),
        ),
    }
}

/// Allocate `size` bytes aligned to `align`.
///
/// The contents of the returned memory are uninitialised.
pub fn alloc_aligned(size: usize, align: usize) -> NonNull<u8> {
    let layout = layout_for(size, align);
    let raw = unsafe { alloc::alloc(layout) };
    NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout))
}

/// Allocate `size` zeroed bytes aligned to `align`.
pub fn alloc_zeroed_aligned(size: usize, align: usize) -> NonNull<u8> {
    let layout = layout_for(size, align);
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout))
}

/// Free memory previously returned by `alloc_aligned` or `alloc_zeroed_aligned`.
///
/// # Safety
/// `ptr` must have been allocated by this module with the same `size` and `align`.
pub unsafe fn free(ptr: NonNull<u8>, size: usize, align: usize) {
    alloc::dealloc(ptr.as_ptr(), layout_for(size, align));
}

/// Copy `size` bytes from `src` to `dst`.
///
/// # Safety
/// Both regions must be valid for `size` bytes and must not overlap.
pub unsafe fn copy(src: *const u8, dst: *mut u8, size: usize) {
    ptr::copy_nonoverlapping(src, dst, size);
}

/// Zero `size` bytes starting at `ptr`.
///
/// # Safety
/// The region must be valid for writes of `size` bytes.
pub unsafe fn clear(ptr: *mut u8, size: usize) {
    ptr::write_bytes(ptr, 0, size);
}

/// Grow (or shrink) an aligned allocation.
///
/// Aligned allocations cannot be reliably grown in place, so this always
/// allocates a new zeroed region, copies the common prefix and frees the old
/// region.
///
/// # Safety
/// `ptr` must have been allocated by this module with `old_size` and `align`.
/// It is invalid after this call returns.
pub unsafe fn realloc_aligned(ptr: NonNull<u8>, old_size: usize, new_size: usize, align: usize) -> NonNull<u8> {
    let new_ptr = alloc_zeroed_aligned(new_size, align);
    copy(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
    free(ptr, old_size, align);
    new_ptr
}

/// A single owned, zero-initialised, aligned block of bytes.
///
/// This is the unit of storage for component data. The contents are only ever
/// accessed through raw pointers, since component types may contain padding.
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

unsafe impl Send for AlignedBlock {}

unsafe impl Sync for AlignedBlock {}

impl AlignedBlock {
    /// Allocate a new zeroed block.
    pub fn new(size: usize, align: usize) -> AlignedBlock {
        AlignedBlock {
            ptr: alloc_zeroed_aligned(size, align),
            size,
            align,
        }
    }

    /// Return the size of this block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Return the alignment of this block.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Return a pointer to the start of the block.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return a mutable pointer to the start of the block.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Overwrite the contents of this block with another block of the same size.
    pub fn copy_from(&mut self, other: &AlignedBlock) {
        assert_eq!(self.size, other.size, "block size mismatch");
        unsafe { copy(other.as_ptr(), self.as_mut_ptr(), self.size) };
    }

    /// Zero the contents of this block.
    pub fn clear(&mut self) {
        unsafe { clear(self.as_mut_ptr(), self.size) };
    }
}

impl Clone for AlignedBlock {
    fn clone(&self) -> AlignedBlock {
        let ptr = alloc_aligned(self.size, self.align);
        unsafe { copy(self.as_ptr(), ptr.as_ptr(), self.size) };
        AlignedBlock {
            ptr,
            size: self.size,
            align: self.align,
        }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe { free(self.ptr, self.size, self.align) };
    }
}

impl Debug for AlignedBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AlignedBlock({:p}, {} bytes)", self.ptr, self.size)
    }
}

/// A fixed-capacity, fully initialised array of plain data with explicit alignment.
///
/// Unlike `Vec`, there is no separate length: every slot up to the capacity
/// holds a value. Growing fills the new slots with a caller-supplied value.
pub struct AlignedArray<T: Pod> {
    ptr: NonNull<u8>,
    capacity: usize,
    align: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod + Send> Send for AlignedArray<T> {}

unsafe impl<T: Pod + Sync> Sync for AlignedArray<T> {}

impl<T: Pod> AlignedArray<T> {
    /// Create a new array with `capacity` slots all set to `fill`.
    pub fn new(capacity: usize, align: usize, fill: T) -> AlignedArray<T> {
        let align = align.max(std::mem::align_of::<T>());
        let ptr = alloc_zeroed_aligned(array_size::<T>(capacity), align);
        let mut array = AlignedArray {
            ptr,
            capacity,
            align,
            _marker: PhantomData,
        };
        array.fill(fill);
        array
    }

    /// Create a new array holding a copy of `values`.
    pub fn from_slice(values: &[T], align: usize) -> AlignedArray<T> {
        let mut array = AlignedArray::new(values.len(), align, T::zeroed());
        array.copy_from_slice(values);
        array
    }

    /// Return the number of slots in this array.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the alignment of the underlying allocation.
    pub fn align(&self) -> usize {
        self.align
    }

    fn byte_size(&self) -> usize {
        array_size::<T>(self.capacity)
    }

    /// Grow the array to `new_capacity` slots, filling the new slots with `fill`.
    ///
    /// Shrinking is not supported; a smaller capacity is ignored.
    pub fn grow(&mut self, new_capacity: usize, fill: T) {
        if new_capacity <= self.capacity {
            return;
        }

        let old_capacity = self.capacity;
        let new_size = array_size::<T>(new_capacity);
        self.ptr = unsafe { realloc_aligned(self.ptr, self.byte_size(), new_size, self.align) };
        self.capacity = new_capacity;
        self[old_capacity..].fill(fill);
    }

    /// Replace the contents of the array with `values`, reallocating if the
    /// capacity differs.
    pub fn assign(&mut self, values: &[T]) {
        if values.len() != self.capacity {
            *self = AlignedArray::new(values.len(), self.align, T::zeroed());
        }
        self.copy_from_slice(values);
    }
}

impl<T: Pod> Deref for AlignedArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const T, self.capacity) }
    }
}

impl<T: Pod> DerefMut for AlignedArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut T, self.capacity) }
    }
}

impl<T: Pod> Clone for AlignedArray<T> {
    fn clone(&self) -> AlignedArray<T> {
        AlignedArray::from_slice(self, self.align)
    }
}

impl<T: Pod> Drop for AlignedArray<T> {
    fn drop(&mut self) {
        unsafe { free(self.ptr, self.byte_size(), self.align) };
    }
}

impl<T: Pod + Debug> Debug for AlignedArray<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_alignment() {
        let block = AlignedBlock::new(BLOCK_SIZE, CACHE_LINE);
        assert_eq!(block.as_ptr() as usize % CACHE_LINE, 0);

        let table = AlignedArray::<u32>::new(16, PAGE_SIZE, 0);
        assert_eq!(table.as_ptr() as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        let ptr = alloc_aligned(8, CACHE_LINE);
        unsafe {
            ptr::copy_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), ptr.as_ptr(), 8);
            let grown = realloc_aligned(ptr, 8, 32, CACHE_LINE);
            let bytes = std::slice::from_raw_parts(grown.as_ptr(), 32);
            assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
            assert!(bytes[8..].iter().all(|b| *b == 0));
            free(grown, 32, CACHE_LINE);
        }
    }

    #[test]
    fn test_array_grow() {
        let mut array = AlignedArray::<u32>::new(2, CACHE_LINE, 7);
        array[1] = 3;
        array.grow(5, u32::MAX);
        assert_eq!(&array[..], &[7, 3, u32::MAX, u32::MAX, u32::MAX]);

        array.grow(1, 0);
        assert_eq!(array.capacity(), 5);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_array_size_overflow() {
        AlignedArray::<u32>::new(1 << 62, CACHE_LINE, 0);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_array_grow_overflow() {
        let mut array = AlignedArray::<u64>::new(4, CACHE_LINE, 0);
        array.grow(usize::MAX / 4, 0);
    }

    #[test]
    fn test_block_clone() {
        let mut block = AlignedBlock::new(128, CACHE_LINE);
        unsafe { *block.as_mut_ptr().add(5) = 9 };

        let copy = block.clone();
        block.clear();
        assert_eq!(unsafe { *copy.as_ptr().add(5) }, 9);
        assert_eq!(unsafe { *block.as_ptr().add(5) }, 0);
    }
}

//! Entity handles.
//!
//! An entity has no data of its own: it is an index into the registry's
//! generation table, paired with the generation it was issued with. When an
//! entity is destroyed its generation is bumped, which invalidates every
//! outstanding copy of the handle, and its index is recycled.

use std::fmt::{self, Debug, Formatter};

use bytemuck::{Pod, Zeroable};

use crate::memory::{AlignedArray, CACHE_LINE};

/// A versioned handle to an entity.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct EntityID {
    index: u32,
    generation: u32,
}

impl EntityID {
    /// The null entity. It is never valid in any registry.
    pub const NULL: EntityID = EntityID {
        index: u32::MAX,
        generation: 0,
    };

    /// Construct an entity handle from its raw parts.
    pub const fn new(index: u32, generation: u32) -> EntityID {
        EntityID { index, generation }
    }

    /// Return the index of this entity in the generation table.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Return the generation this handle was issued with.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns true if this is the null entity.
    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }
}

impl Default for EntityID {
    fn default() -> EntityID {
        EntityID::NULL
    }
}

impl Debug for EntityID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "EntityID(null)")
        } else {
            write!(f, "EntityID({}v{})", self.index, self.generation)
        }
    }
}

/// A LIFO stack of recycled entity indices.
///
/// Recently freed indices are handed out first, since their generation table
/// entries are most likely still in cache.
pub struct FreeIndexStack {
    indices: AlignedArray<u32>,
    len: usize,
}

impl FreeIndexStack {
    /// Create a new, empty, stack with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> FreeIndexStack {
        FreeIndexStack {
            indices: AlignedArray::new(capacity.max(1), CACHE_LINE, 0),
            len: 0,
        }
    }

    /// Return the number of indices on the stack.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the number of indices the stack can hold without growing.
    pub fn capacity(&self) -> usize {
        self.indices.capacity()
    }

    /// Push an index onto the stack, doubling the storage if it is full.
    pub fn push(&mut self, index: u32) {
        if self.len == self.indices.capacity() {
            self.indices.grow(self.indices.capacity() * 2, 0);
        }

        self.indices[self.len] = index;
        self.len += 1;
    }

    /// Pop the most recently pushed index.
    ///
    /// Panics if the stack is empty; callers must check `is_empty` first.
    pub fn pop(&mut self) -> u32 {
        assert!(self.len > 0, "free index stack underflow");
        self.len -= 1;
        self.indices[self.len]
    }

    /// Return the most recently pushed index without removing it.
    ///
    /// Panics if the stack is empty.
    pub fn peek(&self) -> u32 {
        assert!(self.len > 0, "free index stack underflow");
        self.indices[self.len - 1]
    }

    /// Return the contents of the stack, oldest first.
    pub fn as_slice(&self) -> &[u32] {
        &self.indices[..self.len]
    }

    /// Replace the contents of the stack.
    pub fn assign(&mut self, indices: &[u32]) {
        if indices.len() > self.indices.capacity() {
            self.indices.grow(indices.len(), 0);
        }

        self.indices[..indices.len()].copy_from_slice(indices);
        self.len = indices.len();
    }
}

impl Debug for FreeIndexStack {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_null() {
        assert!(EntityID::NULL.is_null());
        assert!(!EntityID::new(0, 0).is_null());
        assert_eq!(EntityID::default(), EntityID::NULL);
        assert_eq!(format!("{:?}", EntityID::new(3, 1)), "EntityID(3v1)");
    }

    #[test]
    fn test_ordering() {
        assert!(EntityID::new(1, 5) < EntityID::new(2, 0));
        assert!(EntityID::new(1, 0) < EntityID::new(1, 1));
        assert_ne!(EntityID::new(1, 0), EntityID::new(1, 1));
    }

    #[test]
    fn test_free_stack() {
        let mut stack = FreeIndexStack::with_capacity(1);
        stack.push(4);
        stack.push(9);
        stack.push(2);
        assert_eq!(stack.len(), 3);
        assert!(stack.capacity() >= 3);
        assert_eq!(stack.peek(), 2);
        assert_eq!(stack.pop(), 2);
        assert_eq!(stack.pop(), 9);
        assert_eq!(stack.as_slice(), &[4]);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_free_stack_underflow() {
        let mut stack = FreeIndexStack::with_capacity(4);
        stack.pop();
    }
}

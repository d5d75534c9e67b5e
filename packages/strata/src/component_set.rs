//! Sorted sets of component types.

use std::ops::Deref;

use crate::component::{Component, ComponentTypeID};

/// A `Vec`-backed set of component types, kept sorted and free of duplicates.
///
/// These are used for declaring which components a system touches, and which
/// components a query requires or excludes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentSet(Vec<ComponentTypeID>);

impl ComponentSet {
    /// Create a new `ComponentSet` from a `Vec` of component types.
    pub fn new(mut component_types: Vec<ComponentTypeID>) -> ComponentSet {
        component_types.sort();
        component_types.dedup();
        ComponentSet(component_types)
    }

    /// Return the sorted slice of component types in this set.
    pub fn as_slice(&self) -> &[ComponentTypeID] {
        &self.0
    }

    /// Return the number of component types in this set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert a component type into this set.
    pub fn insert(&mut self, component_type: ComponentTypeID) {
        if let Err(idx) = self.0.binary_search(&component_type) {
            self.0.insert(idx, component_type);
        }
    }

    /// Insert a static component type into this set.
    pub fn insert_type<T: Component>(&mut self) {
        self.insert(T::type_id())
    }

    /// Remove a component type from this set.
    pub fn remove(&mut self, component_type: ComponentTypeID) {
        if let Ok(idx) = self.0.binary_search(&component_type) {
            self.0.remove(idx);
        }
    }

    /// Returns true if this set contains the given component type.
    pub fn includes(&self, component_type: &ComponentTypeID) -> bool {
        self.0.binary_search(component_type).is_ok()
    }

    /// Returns true if this set contains all of the given component types.
    pub fn includes_all<T: Deref<Target = ComponentTypeID>>(&self, component_types: impl IntoIterator<Item = T>) -> bool {
        component_types.into_iter().all(|ct| self.includes(&*ct))
    }

    /// Returns true if the two sets share at least one component type.
    pub fn intersects(&self, other: &ComponentSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }

        false
    }

    /// Iterate over the component types in this set.
    pub fn iter(&self) -> std::slice::Iter<'_, ComponentTypeID> {
        self.0.iter()
    }
}

impl From<Vec<ComponentTypeID>> for ComponentSet {
    fn from(component_types: Vec<ComponentTypeID>) -> Self {
        ComponentSet::new(component_types)
    }
}

impl<'a> IntoIterator for &'a ComponentSet {
    type Item = &'a ComponentTypeID;
    type IntoIter = std::slice::Iter<'a, ComponentTypeID>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sorted_unique() {
        let set = ComponentSet::new(vec![
            ComponentTypeID::new(5),
            ComponentTypeID::new(1),
            ComponentTypeID::new(5),
        ]);
        assert_eq!(set.as_slice(), &[ComponentTypeID::new(1), ComponentTypeID::new(5)]);
    }

    #[test]
    fn test_insert_remove() {
        let mut set = ComponentSet::default();
        set.insert(ComponentTypeID::new(3));
        set.insert(ComponentTypeID::new(1));
        set.insert(ComponentTypeID::new(3));
        assert_eq!(set.len(), 2);
        assert!(set.includes(&ComponentTypeID::new(3)));

        set.remove(ComponentTypeID::new(3));
        assert!(!set.includes(&ComponentTypeID::new(3)));
        assert!(set.includes_all(&[ComponentTypeID::new(1)]));
    }

    #[test]
    fn test_intersects() {
        let a = ComponentSet::new(vec![ComponentTypeID::new(1), ComponentTypeID::new(4)]);
        let b = ComponentSet::new(vec![ComponentTypeID::new(2), ComponentTypeID::new(4)]);
        let c = ComponentSet::new(vec![ComponentTypeID::new(2), ComponentTypeID::new(3)]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(!a.intersects(&ComponentSet::default()));
    }
}

//! Base definitions for components.
//!
//! Entities are nothing more than a set of attached components. This module
//! provides the means of defining component types and assigning them unique
//! IDs.
//!
//! Each component type is allocated a dense, process-wide ID the first time it
//! is used. There is a macro (`component`) to help you assign this ID.

use std::alloc::Layout;
use std::any::type_name;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use crate::sparse_set::{ErasedStorage, SparseSet};

/// A component type ID which is unique for a specific component type.
///
/// IDs are assigned densely, in registration order, so they can be used to
/// index per-type tables directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeID(usize);

struct ComponentRegistry {
    component_types: Vec<Arc<ComponentRegistration>>,
}

static COMPONENT_REGISTRY: Lazy<RwLock<ComponentRegistry>> = Lazy::new(|| {
    RwLock::new(ComponentRegistry {
        component_types: Vec::new(),
    })
});

impl ComponentTypeID {
    /// Construct a new `ComponentTypeID` from the inner value.
    pub(crate) fn new(inner: usize) -> ComponentTypeID {
        ComponentTypeID(inner)
    }

    /// Register a component type, returning its new globally unique ID.
    ///
    /// This is normally called once per type through `AutoComponentTypeID`.
    pub fn register<T: Component>() -> ComponentTypeID {
        let mut r = COMPONENT_REGISTRY.write();
        let id = ComponentTypeID(r.component_types.len());
        r.component_types.push(Arc::new(ComponentRegistration::new::<T>(id)));
        id
    }

    /// Fetch the registration for this `ComponentTypeID` returning None if it is
    /// missing from the registry.
    pub fn try_registration(&self) -> Option<Arc<ComponentRegistration>> {
        COMPONENT_REGISTRY.read().component_types.get(self.0).cloned()
    }

    /// Fetch the registration information for a component type.
    pub fn registration(&self) -> Arc<ComponentRegistration> {
        self.try_registration()
            .unwrap_or_else(|| panic!("component type #{} is not registered", self.0))
    }

    /// Return the inner unique ID.
    pub fn id(&self) -> usize {
        self.0
    }

    /// Fetch the memory layout of this component type.
    pub fn layout(&self) -> Layout {
        self.registration().layout()
    }

    /// Return the name of this component type.
    pub fn name(&self) -> &'static str {
        self.registration().name()
    }
}

impl Debug for ComponentTypeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.try_registration() {
            Some(reg) => write!(f, "{}", reg.name()),
            None => write!(f, "ComponentTypeID(#{} missing)", self.0),
        }
    }
}

/// A struct for lazily assigning unique `ComponentTypeID`s.
pub struct AutoComponentTypeID(OnceCell<ComponentTypeID>);

impl AutoComponentTypeID {
    /// Create a new `AutoComponentTypeID`.
    pub const fn new() -> AutoComponentTypeID {
        AutoComponentTypeID(OnceCell::new())
    }

    /// Get the `ComponentTypeID` this struct wraps.
    pub fn get<T: Component>(&self) -> ComponentTypeID {
        *self.0.get_or_init(ComponentTypeID::register::<T>)
    }
}

/// The component trait is implemented on all component types.
///
/// Components are plain, fixed-layout values: they are copied in and out of
/// storage and their bytes are duplicated wholesale by snapshots.
/// Use the `component` macro to implement this trait.
pub trait Component: Debug + Copy + Send + Sync + 'static {
    /// Get the unique type ID of this component.
    fn type_id() -> ComponentTypeID;
}

/// A ComponentRegistration is the dynamic version of a type implementing Component.
#[derive(Clone, Copy)]
pub struct ComponentRegistration {
    type_id: ComponentTypeID,
    layout: Layout,
    new_storage: fn(usize) -> Box<dyn ErasedStorage>,
    name: &'static str,
}

impl ComponentRegistration {
    /// Create a ComponentRegistration for a static type.
    pub fn new<T: Component>(type_id: ComponentTypeID) -> ComponentRegistration {
        fn new_storage<T: Component>(capacity: usize) -> Box<dyn ErasedStorage> {
            Box::new(SparseSet::<T>::with_capacity(capacity))
        }

        ComponentRegistration {
            type_id,
            layout: Layout::new::<T>(),
            new_storage: new_storage::<T>,
            name: type_name::<T>(),
        }
    }

    /// Return the unique type ID for this `ComponentRegistration`.
    pub fn type_id(&self) -> ComponentTypeID {
        self.type_id
    }

    /// Return the memory layout of a single instance of this component.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Get the name of this component type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create an empty, type-erased storage for this component type.
    pub fn new_storage(&self, capacity: usize) -> Box<dyn ErasedStorage> {
        (self.new_storage)(capacity)
    }
}

impl PartialEq for ComponentRegistration {
    fn eq(&self, other: &ComponentRegistration) -> bool {
        self.type_id.eq(&other.type_id)
    }
}

impl Eq for ComponentRegistration {}

impl Debug for ComponentRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<ComponentRegistration {} {}>", self.type_id.id(), self.name)
    }
}

/// Implement the `Component` trait on a type.
///
/// Component types must implement Copy and Debug.
#[macro_export]
macro_rules! component {
    ($i:ident) => {
        const _: () = {
            static INIT_TYPE: $crate::component::AutoComponentTypeID = $crate::component::AutoComponentTypeID::new();

            impl $crate::component::Component for $i {
                fn type_id() -> $crate::component::ComponentTypeID {
                    INIT_TYPE.get::<$i>()
                }
            }
        };
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_uniqueness() {
        #[derive(Debug, Clone, Copy, Default)]
        struct A;
        #[derive(Debug, Clone, Copy, Default)]
        struct B;

        component!(A);
        component!(B);

        assert_ne!(A::type_id(), B::type_id());
        assert_eq!(A::type_id(), A::type_id());
    }

    #[test]
    fn test_registration() {
        #[derive(Debug, Clone, Copy)]
        struct A(u8);

        component!(A);

        let registration = A::type_id().registration();
        assert_eq!(registration.type_id(), A::type_id());
        assert_eq!(registration.layout(), Layout::new::<A>());
        assert!(registration.name().ends_with("A"));

        let storage = registration.new_storage(4);
        assert_eq!(storage.component_type(), A::type_id());
        assert_eq!(storage.len(), 0);
    }
}

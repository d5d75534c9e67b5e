//! Systems and their registrations.

use std::any::type_name;

use crate::command_buffer::CommandBuffer;
use crate::component::{Component, ComponentTypeID};
use crate::component_set::ComponentSet;
use crate::registry::Registry;

/// The view of the world given to a running system.
pub struct SystemContext<'a> {
    registry: &'a Registry,
    commands: &'a CommandBuffer,
}

impl<'a> SystemContext<'a> {
    /// Create a new context.
    pub fn new(registry: &'a Registry, commands: &'a CommandBuffer) -> SystemContext<'a> {
        SystemContext { registry, commands }
    }

    /// Return the registry.
    ///
    /// Component storages should only be locked for the types the system
    /// declared in its registration.
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Return the command buffer for structural changes.
    ///
    /// Commands are applied once the system's layer has finished.
    pub fn commands(&self) -> &'a CommandBuffer {
        self.commands
    }
}

/// An ECS system.
pub trait System: Send {
    /// Run the system once.
    fn run(&mut self, context: &SystemContext<'_>);

    /// Return a human readable name for this system.
    fn name(&self) -> &str {
        type_name::<Self>()
    }
}

impl<F: FnMut(&SystemContext<'_>) + Send> System for F {
    fn run(&mut self, context: &SystemContext<'_>) {
        self(context)
    }
}

/// A token which represents a system in a `Scheduler`.
///
/// These tokens are not unique between schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemToken(pub usize);

pub(crate) type BoxedSystem = Box<dyn System + 'static>;

/// A registration used for adding systems to a `Scheduler`.
///
/// The registration declares which component types the system reads and
/// writes. Two systems conflict when either writes a type the other touches;
/// conflicting systems never run at the same time.
pub struct SystemRegistration {
    pub(crate) system: BoxedSystem,
    pub(crate) name: Option<String>,
    pub(crate) before: Vec<SystemToken>,
    pub(crate) after: Vec<SystemToken>,
    pub(crate) reads: ComponentSet,
    pub(crate) writes: ComponentSet,
}

impl SystemRegistration {
    /// Create a new registration from the boxed system.
    fn new(system: BoxedSystem) -> SystemRegistration {
        SystemRegistration {
            system,
            name: None,
            before: Vec::new(),
            after: Vec::new(),
            reads: ComponentSet::default(),
            writes: ComponentSet::default(),
        }
    }

    /// Create a new registration from any object implementing `System`.
    pub fn from_system(system: impl System + 'static) -> SystemRegistration {
        let boxed = Box::new(system) as BoxedSystem;
        SystemRegistration::new(boxed)
    }

    /// Override the name reported for this system.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require that this system is run before the system represented
    /// by the given token.
    pub fn before(mut self, system: SystemToken) -> Self {
        if let Err(insert_idx) = self.before.binary_search(&system) {
            self.before.insert(insert_idx, system);
        }

        self
    }

    /// Require that this system is run after the system represented
    /// by the given token.
    pub fn after(mut self, system: SystemToken) -> Self {
        if let Err(insert_idx) = self.after.binary_search(&system) {
            self.after.insert(insert_idx, system);
        }

        self
    }

    /// Declare that this system reads the given component type.
    pub fn read_component_type(mut self, component_type: ComponentTypeID) -> Self {
        self.reads.insert(component_type);
        self
    }

    /// Declare that this system reads the given component type.
    pub fn read<T: Component>(self) -> Self {
        self.read_component_type(T::type_id())
    }

    /// Declare that this system writes the given component type.
    pub fn write_component_type(mut self, component_type: ComponentTypeID) -> Self {
        self.writes.insert(component_type);
        self
    }

    /// Declare that this system writes the given component type.
    pub fn write<T: Component>(self) -> Self {
        self.write_component_type(T::type_id())
    }

    /// Returns true if this registration conflicts with another.
    pub fn conflicts_with(&self, other: &SystemRegistration) -> bool {
        self.writes.intersects(&other.reads)
            || self.writes.intersects(&other.writes)
            || self.reads.intersects(&other.writes)
    }
}

use crossbeam_queue::SegQueue;
use tracing::trace;

use crate::component::Component;
use crate::entity::EntityID;
use crate::registry::Registry;

type Command = Box<dyn FnOnce(&mut Registry) + Send>;

/// A command buffer for structural changes.
///
/// Systems running in parallel only have shared access to the `Registry`, so
/// they cannot create or destroy entities or attach components directly.
/// Instead they record those changes here, from any thread, and the changes
/// are applied in the order they were recorded when the buffer is played back
/// at a synchronisation point.
#[derive(Default)]
pub struct CommandBuffer {
    commands: SegQueue<Command>,
}

impl CommandBuffer {
    /// Create a new, empty, command buffer.
    pub fn new() -> CommandBuffer {
        CommandBuffer {
            commands: SegQueue::new(),
        }
    }

    /// Return the number of pending commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if there are no pending commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Record an arbitrary structural change.
    pub fn push(&self, command: impl FnOnce(&mut Registry) + Send + 'static) {
        self.commands.push(Box::new(command));
    }

    /// Create a new entity.
    pub fn create_entity(&self) {
        self.push(|registry| {
            registry.create();
        });
    }

    /// Create a new entity and then call `f` to populate it.
    pub fn create_entity_with(&self, f: impl FnOnce(&mut Registry, EntityID) + Send + 'static) {
        self.push(move |registry| {
            let entity = registry.create();
            f(registry, entity);
        });
    }

    /// Destroy an entity.
    pub fn destroy_entity(&self, entity: EntityID) {
        self.push(move |registry| {
            registry.destroy(entity);
        });
    }

    /// Set a single component on an entity.
    pub fn add_component<T: Component>(&self, entity: EntityID, component: T) {
        self.push(move |registry| {
            registry.add(entity, component);
        });
    }

    /// Remove a single component from an entity.
    pub fn remove_component<T: Component>(&self, entity: EntityID) {
        self.push(move |registry| {
            registry.remove::<T>(entity);
        });
    }

    /// Apply every pending command to the registry, in the order they were
    /// recorded, returning the number applied.
    pub fn playback(&self, registry: &mut Registry) -> usize {
        let mut applied = 0;
        while let Some(command) = self.commands.pop() {
            command(registry);
            applied += 1;
        }

        if applied > 0 {
            trace!(applied, "played back commands");
        }
        applied
    }

    /// Drop every pending command without applying it.
    pub fn clear(&self) {
        while self.commands.pop().is_some() {}
    }
}

#[cfg(test)]
mod test {
    use rayon::prelude::*;

    use super::*;
    use crate::component;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Score(u32);

    component!(Score);

    #[test]
    fn test_fifo() {
        let mut registry = Registry::new();
        let e = registry.create();
        let buffer = CommandBuffer::new();

        buffer.add_component(e, Score(1));
        buffer.add_component(e, Score(2));
        buffer.remove_component::<Score>(e);
        buffer.add_component(e, Score(3));
        assert_eq!(buffer.len(), 4);

        assert_eq!(buffer.playback(&mut registry), 4);
        assert!(buffer.is_empty());
        assert_eq!(registry.get::<Score>(e), Some(Score(3)));
    }

    #[test]
    fn test_create_destroy() {
        let mut registry = Registry::new();
        let doomed = registry.create();
        let buffer = CommandBuffer::new();

        buffer.destroy_entity(doomed);
        buffer.create_entity();
        buffer.create_entity_with(|registry, e| {
            registry.add(e, Score(7));
        });
        buffer.playback(&mut registry);

        assert!(!registry.is_valid(doomed));
        assert_eq!(registry.alive_count(), 2);
        assert_eq!(registry.query().with::<Score>().count(), 1);
    }

    #[test]
    fn test_concurrent_record() {
        let mut registry = Registry::new();
        let buffer = CommandBuffer::new();

        (0..1000u32).into_par_iter().for_each(|i| {
            buffer.create_entity_with(move |registry, e| {
                registry.add(e, Score(i));
            });
        });

        assert_eq!(buffer.playback(&mut registry), 1000);
        assert_eq!(registry.alive_count(), 1000);
        assert_eq!(registry.read::<Score>().unwrap().len(), 1000);
    }

    #[test]
    fn test_clear() {
        let mut registry = Registry::new();
        let buffer = CommandBuffer::new();
        buffer.create_entity();
        buffer.clear();
        assert_eq!(buffer.playback(&mut registry), 0);
        assert_eq!(registry.alive_count(), 0);
    }
}

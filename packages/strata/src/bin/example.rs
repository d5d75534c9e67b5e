use strata::{component, CommandBuffer, Registry, SnapshotManager};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MyComponent(i32);

component!(MyComponent);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut registry = Registry::new();
    let mut history = SnapshotManager::new(8);

    let command_buffer = CommandBuffer::new();
    let entity = registry.create();
    command_buffer.add_component(entity, MyComponent(3));
    command_buffer.playback(&mut registry);

    let frame = history.record_frame(&mut registry, false);
    registry.add(entity, MyComponent(4));

    println!("registry: {:?}", registry);
    println!("entity: {:?} = {:?}", entity, registry.get::<MyComponent>(entity));

    for component in registry.component_types() {
        println!("component: {:?}", component);
    }

    if let Some(snapshot) = history.frame(frame).cloned() {
        history.load_snapshot(&mut registry, &snapshot);
        println!("after restoring frame {}: {:?}", frame, registry.get::<MyComponent>(entity));
    }
}

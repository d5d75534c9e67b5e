use std::time::Instant;

use strata::{component, join, CommandBuffer, Registry, SnapshotManager};

#[derive(Debug, Clone, Copy, Default)]
pub struct MyComponent(i32);

component!(MyComponent);

#[derive(Debug, Clone, Copy, Default)]
pub struct Marker;

component!(Marker);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("strata=info".parse()?),
        )
        .init();

    let mut registry = Registry::new();
    let mut history = SnapshotManager::new(4);
    let mut to_delete = Vec::new();

    for frame in 0..8 {
        let start = Instant::now();
        let command_buffer = CommandBuffer::new();

        for id in to_delete.drain(..) {
            command_buffer.remove_component::<MyComponent>(id);
        }

        for idx in 0..512 {
            let entity_id = registry.create();
            command_buffer.add_component(entity_id, MyComponent(32));

            if idx % 12 == 11 {
                to_delete.push(entity_id);
            } else if idx % 3 == 0 {
                command_buffer.add_component(entity_id, Marker);
            }
        }

        command_buffer.playback(&mut registry);
        let marked = join::join2_mut::<MyComponent, Marker>(&registry, |_, c, _| c.0 += 1);
        history.record_frame(&mut registry, frame % 2 == 1);

        println!("frame {}: {} marked, {:?}", frame, marked, start.elapsed());
    }

    registry.audit()?;
    println!("registry: {:?}", registry);
    Ok(())
}

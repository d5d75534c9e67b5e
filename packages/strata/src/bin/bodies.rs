use std::collections::HashMap;
use std::io::Write;

use strata::join::{join2, join2_mut};
use strata::{component, Config, EntityID, Registry, Scheduler, System, SystemContext, SystemRegistration};

const G: f32 = 10.0;
const TIME_STEP: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct Position(f32, f32);
component!(Position);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity(f32, f32);
component!(Velocity);

#[derive(Debug, Clone, Copy, Default)]
pub struct Mass(f32);
component!(Mass);

struct ApplyAcceleration;

impl System for ApplyAcceleration {
    fn run(&mut self, context: &SystemContext<'_>) {
        let registry = context.registry();

        let mut bodies = Vec::new();
        join2::<Position, Mass>(registry, |id, p, m| bodies.push((id, *p, *m)));

        join2_mut::<Velocity, Position>(registry, |id_a, velocity, position| {
            let Position(x_a, y_a) = *position;
            let Velocity(vx_a, vy_a) = velocity;

            *vx_a = 0f32;
            *vy_a = 0f32;

            for (id_b, Position(x_b, y_b), Mass(m_b)) in bodies.iter().copied() {
                if id_b == id_a || m_b < 0.00001 {
                    continue;
                }

                let dx = x_b - x_a;
                let dy = y_b - y_a;
                let r2 = dx * dx + dy * dy;

                // Bodies are overlapped!
                if r2 < 0.0005 {
                    context.commands().destroy_entity(id_a);
                    return;
                }

                let a = (G * m_b) / r2;
                let r = r2.sqrt();
                *vx_a += TIME_STEP * ((dx * a) / r);
                *vy_a += TIME_STEP * ((dy * a) / r);
            }
        });
    }

    fn name(&self) -> &str {
        "apply_acceleration"
    }
}

fn apply_velocity(context: &SystemContext<'_>) {
    join2_mut::<Position, Velocity>(context.registry(), |_, Position(x, y), Velocity(vx, vy)| {
        *x += TIME_STEP * vx;
        *y += TIME_STEP * vy;
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut registry = Registry::with_config(config.clone());

    // Populate registry!
    {
        const SQRT_NUM_ENTITIES: usize = 8;
        const SCALE: f32 = 2.0 / ((SQRT_NUM_ENTITIES - 1) as f32);

        for x in 0..SQRT_NUM_ENTITIES {
            for y in 0..SQRT_NUM_ENTITIES {
                let x = ((x as f32) * SCALE) - 1.0;
                let y = ((y as f32) * SCALE) - 1.0;

                let vx = y * 0.003;
                let vy = -x * 0.003;

                let id = registry.create();
                registry.add(id, Mass(0.00001));
                registry.add(id, Position(x, y));
                registry.add(id, Velocity(vx, vy));
            }
        }
    }

    let mut scheduler = Scheduler::with_config(&config)?;

    let accel_sys = scheduler.add_system(
        SystemRegistration::from_system(ApplyAcceleration)
            .read::<Position>()
            .read::<Mass>()
            .write::<Velocity>())?;
    scheduler.add_system(
        SystemRegistration::from_system(apply_velocity)
            .named("apply_velocity")
            .read::<Velocity>()
            .write::<Position>()
            .after(accel_sys))?;

    const SIZE: (i32, i32) = (500, 500);
    const OFFSET: (f32, f32) = (250.0, 250.0);
    const SCALE: (f32, f32) = (200.0, 200.0);
    const NUM_ITER: usize = 100;

    let mut dest = std::io::stdout();
    let mut last_positions: HashMap<EntityID, (f32, f32)> = HashMap::new();

    writeln!(&mut dest, "<?xml version=\"1.0\" standalone=\"no\"?>")?;
    writeln!(&mut dest, "<!DOCTYPE svg PUBLIC \"-//W3C//DTD SVG 1.0//EN\" \"http://www.w3.org/TR/2001/REC-SVG-20010904/DTD/svg10.dtd\">")?;
    write!(&mut dest, "<svg xmlns=\"http://www.w3.org/2000/svg\" height=\"{}\" width=\"{}\">", SIZE.0, SIZE.1)?;
    write!(&mut dest, "<rect width=\"100%\" height=\"100%\" fill=\"black\"/>")?;

    for _ in 0..NUM_ITER {
        for _ in 0..10usize {
            scheduler.run(&mut registry);
        }

        // Render result!
        let mut bodies = Vec::new();
        join2::<Position, Velocity>(&registry, |id, p, v| bodies.push((id, *p, *v)));

        for (id, Position(x, y), Velocity(vx, vy)) in bodies {
            let v2 = (vx * vx + vy * vy).sqrt();
            let a = 1.0 - (v2 / 0.03).clamp(0.0, 0.7);

            if let Some((lx, ly)) = last_positions.get(&id) {
                let x1 = lx * SCALE.0 + OFFSET.0;
                let y1 = ly * SCALE.1 + OFFSET.1;
                let x2 = x * SCALE.0 + OFFSET.0;
                let y2 = y * SCALE.1 + OFFSET.1;

                write!(&mut dest,
                       "<line x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\" style=\"stroke:rgba(255,0,0,{});stroke-width:1\" />",
                       x1, y1, x2, y2, a)?;
            }

            last_positions.insert(id, (x, y));
        }
    }

    write!(&mut dest, "</svg>")?;
    Ok(())
}

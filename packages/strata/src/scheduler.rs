//! Dependency-aware parallel system execution.
//!
//! Whenever the set of systems changes, the scheduler rebuilds a dependency
//! graph: a system which conflicts with an earlier-registered system depends
//! on it, and explicit `before`/`after` constraints add further edges. The
//! graph is then split into layers with Kahn's algorithm. Systems within a
//! layer have no conflicts and run in parallel; layers run in order.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, error, trace};

use crate::command_buffer::CommandBuffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::system::{SystemContext, SystemRegistration, SystemToken};

struct SystemNode {
    registration: SystemRegistration,
    token: SystemToken,
    name: String,
    layer: usize,
    last_duration: Duration,
}

impl SystemNode {
    fn run(&mut self, context: &SystemContext<'_>) {
        let start = Instant::now();
        self.registration.system.run(context);
        self.last_duration = start.elapsed();
        trace!(system = %self.name, duration = ?self.last_duration, "system finished");
    }
}

/// Timing information for a single system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemMetrics {
    /// The system this entry describes.
    pub token: SystemToken,
    /// The system's name.
    pub name: String,
    /// The layer the system runs in.
    pub layer: usize,
    /// The wall-clock time of the most recent run.
    pub duration: Duration,
}

/// The result of laying out the system graph.
struct GraphLayout {
    layers: Vec<Vec<usize>>,
}

fn add_edge(successors: &mut [Vec<usize>], in_degree: &mut [usize], from: usize, to: usize) {
    if from != to && !successors[from].contains(&to) {
        successors[from].push(to);
        in_degree[to] += 1;
    }
}

fn build_layout(nodes: &[SystemNode]) -> Result<GraphLayout> {
    let count = nodes.len();
    let mut successors = vec![Vec::new(); count];
    let mut in_degree = vec![0; count];
    let position = |token: &SystemToken| nodes.iter().position(|n| n.token == *token);

    for i in 0..count {
        for j in (i + 1)..count {
            if nodes[i].registration.conflicts_with(&nodes[j].registration) {
                add_edge(&mut successors, &mut in_degree, i, j);
            }
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        for j in node.registration.before.iter().filter_map(position) {
            add_edge(&mut successors, &mut in_degree, i, j);
        }
        for j in node.registration.after.iter().filter_map(position) {
            add_edge(&mut successors, &mut in_degree, j, i);
        }
    }

    let mut layers = Vec::new();
    let mut current: Vec<usize> = (0..count).filter(|i| in_degree[*i] == 0).collect();
    let mut scheduled = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &node in current.iter() {
            for &succ in successors[node].iter() {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }

        next.sort_unstable();
        scheduled += current.len();
        layers.push(std::mem::replace(&mut current, next));
    }

    if scheduled < count {
        let systems: Vec<String> = (0..count)
            .filter(|i| in_degree[*i] > 0)
            .map(|i| nodes[i].name.clone())
            .collect();
        error!(?systems, "system dependency cycle");
        return Err(Error::SchedulingDeadlock { systems });
    }

    Ok(GraphLayout { layers })
}

/// A set of systems which are run against a `Registry`.
pub struct Scheduler {
    next_system_id: usize,
    nodes: Vec<SystemNode>,
    layers: Vec<Vec<usize>>,
    commands: CommandBuffer,
    pool: Option<rayon::ThreadPool>,
}

impl Scheduler {
    /// Create a new empty `Scheduler` which runs systems on the global
    /// rayon pool.
    pub fn new() -> Scheduler {
        Scheduler {
            next_system_id: 0,
            nodes: Vec::new(),
            layers: Vec::new(),
            commands: CommandBuffer::new(),
            pool: None,
        }
    }

    /// Create a new empty `Scheduler`, with a dedicated worker pool if the
    /// configuration asks for one.
    pub fn with_config(config: &Config) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new();
        if let Some(threads) = config.worker_threads {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("strata-worker-{}", idx))
                .build()?;
            scheduler.pool = Some(pool);
        }

        Ok(scheduler)
    }

    /// Return the number of systems.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no systems.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Return the command buffer shared by every system.
    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    fn apply_layout(&mut self, layout: GraphLayout) {
        for (layer_idx, layer) in layout.layers.iter().enumerate() {
            for &node in layer.iter() {
                self.nodes[node].layer = layer_idx;
            }
        }

        debug!(systems = self.nodes.len(), layers = layout.layers.len(), "rebuilt system graph");
        self.layers = layout.layers;
    }

    /// Insert a system according to its registration requirements.
    ///
    /// If the system would make the dependency graph cyclic it is not added,
    /// and `Error::SchedulingDeadlock` is returned.
    pub fn add_system(&mut self, registration: SystemRegistration) -> Result<SystemToken> {
        let token = SystemToken(self.next_system_id);
        let name = registration.name.clone()
            .unwrap_or_else(|| registration.system.name().to_owned());

        self.nodes.push(SystemNode {
            registration,
            token,
            name,
            layer: 0,
            last_duration: Duration::ZERO,
        });

        match build_layout(&self.nodes) {
            Ok(layout) => {
                self.next_system_id += 1;
                self.apply_layout(layout);
                Ok(token)
            }
            Err(err) => {
                self.nodes.pop();
                Err(err)
            }
        }
    }

    /// Remove a system, returning false if it was not present.
    pub fn remove_system(&mut self, token: SystemToken) -> Result<bool> {
        let idx = match self.nodes.iter().position(|n| n.token == token) {
            Some(idx) => idx,
            None => return Ok(false),
        };

        self.nodes.remove(idx);
        let layout = build_layout(&self.nodes)?;
        self.apply_layout(layout);
        Ok(true)
    }

    /// Return the tokens of the systems in each layer.
    pub fn layers(&self) -> Vec<Vec<SystemToken>> {
        self.layers.iter()
            .map(|layer| layer.iter().map(|idx| self.nodes[*idx].token).collect())
            .collect()
    }

    /// Return the layer a system runs in.
    pub fn layer_of(&self, token: SystemToken) -> Option<usize> {
        self.nodes.iter().find(|n| n.token == token).map(|n| n.layer)
    }

    /// Return the timings recorded by the most recent run.
    pub fn last_execution_metrics(&self) -> Vec<SystemMetrics> {
        self.nodes.iter()
            .map(|n| SystemMetrics {
                token: n.token,
                name: n.name.clone(),
                layer: n.layer,
                duration: n.last_duration,
            })
            .collect()
    }

    /// Run every system once.
    ///
    /// Each layer is run in parallel and must finish before the next starts.
    /// Commands recorded by a layer are applied before the next layer runs.
    pub fn run(&mut self, registry: &mut Registry) {
        for layer_idx in 0..self.layers.len() {
            {
                let context = SystemContext::new(registry, &self.commands);
                let layer: Vec<&mut SystemNode> = self.nodes.iter_mut()
                    .filter(|n| n.layer == layer_idx)
                    .collect();

                let run_layer = || {
                    layer.into_par_iter().for_each(|node| node.run(&context));
                };

                match &self.pool {
                    Some(pool) => pool.install(run_layer),
                    None => run_layer(),
                }
            }

            self.commands.playback(registry);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

//! A sparse-set entity component system.
//!
//! Components live in per-type sparse sets whose values are packed into
//! fixed-size aligned blocks. Entities with several components are found by
//! AND-ing the storages' presence bitsets, and systems declaring disjoint
//! component access are run in parallel by the layered `Scheduler`. The whole
//! store can be captured into a `Snapshot` and written back later.

pub use bridge::ComponentBridge;
pub use command_buffer::CommandBuffer;
pub use component::{
    Component,
    ComponentTypeID,
};
pub use component_set::ComponentSet;
pub use config::Config;
pub use entity::EntityID;
pub use error::{Error, Result};
pub use join::{JoinCache, JoinMask};
pub use query::{CachedQuery, QueryBuilder};
pub use registry::{Registry, RegistryEvent, SubscriptionID};
pub use scheduler::{Scheduler, SystemMetrics};
pub use snapshot::{Snapshot, SnapshotManager};
pub use sparse_set::SparseSet;
pub use system::{
    System,
    SystemContext,
    SystemRegistration,
    SystemToken,
};

pub mod memory;
pub mod entity;
pub mod component;
pub mod component_set;
pub mod chunked;
pub mod sparse_set;

pub mod registry;
pub mod join;
pub mod query;
pub mod bridge;

mod command_buffer;

pub mod system;
pub mod scheduler;
pub mod snapshot;

pub mod config;
pub mod error;

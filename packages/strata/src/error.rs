//! Error types.
//!
//! Operations on dead entities are not errors: they return `None` or `false`.
//! Errors are reserved for conditions a caller can act on, such as an
//! unschedulable system graph or an invalid configuration file.

use thiserror::Error;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the registry, scheduler and configuration loading.
#[derive(Debug, Error)]
pub enum Error {
    /// The declared system dependencies form a cycle.
    #[error("scheduling deadlock: systems {systems:?} can never be scheduled")]
    SchedulingDeadlock {
        /// The names of the systems left without a layer.
        systems: Vec<String>,
    },

    /// A storage failed its integrity audit.
    #[error("integrity check failed for {component}: {detail}")]
    Integrity {
        /// The name of the offending component type.
        component: &'static str,
        /// What was found to be inconsistent.
        detail: String,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

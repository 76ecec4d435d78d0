//! Worker count planning
//!
//! Derives the number of encode slots from the CPU core count unless the
//! configuration names one explicitly.

use crate::config::Config;

/// Upper bound for derived worker counts
pub const MAX_DERIVED_WORKERS: u32 = 5;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Logical CPU cores seen at planning time
    pub total_cores: u32,
    /// Number of encode slots
    pub workers: u32,
    /// Whether `workers` came from the config rather than derivation
    pub explicit: bool,
}

impl WorkerPlan {
    /// Derive a plan for `total_cores`
    ///
    /// A non-zero `scheduler.workers` is used unchanged.
    pub fn derive_for(cfg: &Config, total_cores: u32) -> Self {
        let explicit = cfg.scheduler.workers > 0;
        let workers = if explicit {
            cfg.scheduler.workers
        } else {
            derive_worker_count(total_cores)
        };
        Self {
            total_cores,
            workers,
            explicit,
        }
    }

    /// Derive a plan using the detected core count
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_for(cfg, num_cpus::get() as u32)
    }
}

/// Encoders use several threads each; leave four cores for the system
/// and budget about seven per encoder, between 1 and [`MAX_DERIVED_WORKERS`].
pub fn derive_worker_count(cores: u32) -> u32 {
    (cores.saturating_sub(4) / 7).clamp(1, MAX_DERIVED_WORKERS)
}

/// Effective worker count for `cfg` on this machine
pub fn effective_workers(cfg: &Config) -> usize {
    WorkerPlan::derive(cfg).workers as usize
}

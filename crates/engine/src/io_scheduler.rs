//! I/O scheduler
//!
//! Once per coordinator tick: promotes low-latency sources straight to
//! `Ready`, and claims at most one other pending job for acquisition,
//! choosing its tier against the RAM budget in the same critical section
//! that reserves it.

use crate::acquire::{run_acquisition, staged_file_name, AcquireContext, AcquireRequest};
use crate::dispatcher::ActiveSessions;
use crate::job::{CacheHandle, JobId, JobState, Tier};
use crate::job_table::{io_in_flight, ram_in_use, JobTable};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limits the scheduler enforces
#[derive(Debug, Clone)]
pub struct IoLimits {
    /// Maximum jobs in `QueuedIo ∪ Caching`
    pub io_concurrency: usize,
    /// `max_ram_load - safe_ram_reserve`, in bytes
    pub ram_budget: u64,
    /// Files at or above this size never go to RAM
    pub max_single_file: u64,
    /// Stage even low-latency sources
    pub stage_low_latency_sources: bool,
}

/// What one tick did
#[derive(Debug, Default, PartialEq)]
pub struct IoTick {
    /// Jobs moved `Pending -> Ready` with tier `Direct`
    pub direct: Vec<JobId>,
    /// Job claimed for acquisition this tick
    pub started: Option<(JobId, Tier)>,
}

enum Claim {
    Stop,
    Skip,
    Claimed(Tier),
}

/// I/O concurrency for a staging directory: 1 on seek-sensitive media
pub fn io_concurrency_for(staging_low_latency: bool, worker_count: usize) -> usize {
    if staging_low_latency {
        worker_count.max(1)
    } else {
        1
    }
}

pub struct IoScheduler {
    table: Arc<JobTable>,
    active: Arc<ActiveSessions>,
    ctx: AcquireContext,
    limits: IoLimits,
    cache_dir: PathBuf,
    run_id: String,
}

impl IoScheduler {
    pub fn new(
        table: Arc<JobTable>,
        active: Arc<ActiveSessions>,
        ctx: AcquireContext,
        limits: IoLimits,
        cache_dir: PathBuf,
        run_id: String,
    ) -> Self {
        Self {
            table,
            active,
            ctx,
            limits,
            cache_dir,
            run_id,
        }
    }

    /// Advance pending jobs; spawns at most one acquisition worker
    pub fn tick(&self, no_wait: bool, run_cancel: &CancellationToken) -> IoTick {
        let mut outcome = IoTick::default();
        if run_cancel.is_cancelled() {
            return outcome;
        }

        for pending in self.table.pending() {
            let direct = !self.limits.stage_low_latency_sources && pending.low_latency_source;

            if direct {
                let promoted = self
                    .table
                    .update(pending.id, |job| {
                        if job.state != JobState::Pending {
                            return false;
                        }
                        job.tier = Tier::Direct;
                        job.cache_handle = Some(CacheHandle::Direct(job.path.clone()));
                        job.transition(JobState::Ready).is_ok()
                    })
                    .unwrap_or(false);
                if promoted {
                    debug!(job = %pending.id, "low-latency source, reading directly");
                    outcome.direct.push(pending.id);
                }
                continue;
            }

            let limits = &self.limits;
            let claim = self.table.with_jobs(|jobs| {
                if io_in_flight(jobs) >= limits.io_concurrency {
                    return Claim::Stop;
                }
                let in_use = ram_in_use(jobs);
                let Some(job) = jobs.iter_mut().find(|j| j.id == pending.id) else {
                    return Claim::Skip;
                };
                if job.state != JobState::Pending {
                    return Claim::Skip;
                }
                let predicted = in_use.saturating_add(job.size_bytes);
                let tier = if predicted < limits.ram_budget && job.size_bytes < limits.max_single_file {
                    Tier::Ram
                } else {
                    Tier::StagedDisk
                };
                job.tier = tier;
                match job.transition(JobState::QueuedIo) {
                    Ok(()) => Claim::Claimed(tier),
                    Err(e) => {
                        warn!(error = %e, "could not claim job");
                        Claim::Skip
                    }
                }
            });

            match claim {
                Claim::Stop => break,
                Claim::Skip => continue,
                Claim::Claimed(tier) => {
                    self.spawn_acquisition(&pending.path, pending.id, pending.size_bytes, tier, no_wait, run_cancel);
                    outcome.started = Some((pending.id, tier));
                    break;
                }
            }
        }

        outcome
    }

    fn spawn_acquisition(
        &self,
        source: &std::path::Path,
        id: JobId,
        size_bytes: u64,
        tier: Tier,
        no_wait: bool,
        run_cancel: &CancellationToken,
    ) {
        let req = AcquireRequest {
            id,
            source: source.to_path_buf(),
            size_bytes,
            tier,
            no_wait,
            staged_dest: self
                .cache_dir
                .join(staged_file_name(&self.run_id, id, source)),
        };
        let cancel = self.active.register(id, run_cancel);
        info!(job = %id, tier = tier.as_str(), size_bytes, path = %source.display(), "acquisition started");
        tokio::spawn(run_acquisition(req, self.ctx.clone(), cancel));
    }
}

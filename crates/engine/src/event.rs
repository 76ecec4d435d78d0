//! Events published by acquisition and encode workers
//!
//! Workers never touch the job table; they send these to the coordinator,
//! which is the single consumer that applies them.

use crate::dispatcher::SlotLease;
use crate::job::{CacheHandle, JobId};
use crate::progress::ProgressSnapshot;
use crate::session::SessionOutcome;

#[derive(Debug)]
pub enum JobEvent {
    /// Acquisition worker is running (`QueuedIo -> Caching`)
    CacheStarted { id: JobId },
    /// Fraction of the source read or copied
    CacheProgress { id: JobId, progress: f64 },
    /// RAM acquisition failed; the worker continues with disk staging
    TierFallback { id: JobId, reason: String },
    CacheReady { id: JobId, handle: CacheHandle },
    CacheFailed { id: JobId, reason: String },
    CacheStopped { id: JobId },
    EncodeProgress { id: JobId, snapshot: ProgressSnapshot },
    /// Session ended; the slot returns to the pool when `lease` is dropped
    EncodeFinished {
        id: JobId,
        outcome: SessionOutcome,
        lease: SlotLease,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::CacheStarted { id }
            | JobEvent::CacheProgress { id, .. }
            | JobEvent::TierFallback { id, .. }
            | JobEvent::CacheReady { id, .. }
            | JobEvent::CacheFailed { id, .. }
            | JobEvent::CacheStopped { id }
            | JobEvent::EncodeProgress { id, .. }
            | JobEvent::EncodeFinished { id, .. } => *id,
        }
    }
}

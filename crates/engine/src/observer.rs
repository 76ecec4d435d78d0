//! Observer interfaces
//!
//! The scheduler exposes data only. Presentation layers implement
//! [`Observer`]; a per-slot [`SlotMonitor`] receives encode progress.

use crate::coordinator::BatchSummary;
use crate::job::{Job, JobId, JobState};
use crate::progress::ProgressSnapshot;
use crate::session::SessionOutcome;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Monitoring channel bound to one encode slot
pub trait SlotMonitor: Send + Sync {
    fn session_started(&self, _job: &Job) {}
    fn session_progress(&self, _job: JobId, _snapshot: &ProgressSnapshot) {}
    fn session_finished(&self, _job: JobId, _outcome: &SessionOutcome) {}
}

/// Slot monitor that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl SlotMonitor for NullMonitor {}

/// Receives job changes as the coordinator applies them
pub trait Observer: Send + Sync {
    /// Called after every applied change, with the job's new state
    fn job_changed(&self, _job: &Job) {}

    fn batch_finished(&self, _summary: &BatchSummary) {}

    /// Monitor for `slot`, when this observer renders slots
    fn slot_monitor(&self, _slot: usize) -> Option<Arc<dyn SlotMonitor>> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Fan out to several observers
#[derive(Default)]
pub struct Observers(Vec<Arc<dyn Observer>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.0.push(observer);
        self
    }
}

impl Observer for Observers {
    fn job_changed(&self, job: &Job) {
        for o in &self.0 {
            o.job_changed(job);
        }
    }

    fn batch_finished(&self, summary: &BatchSummary) {
        for o in &self.0 {
            o.batch_finished(summary);
        }
    }

    /// First observer offering a monitor wins
    fn slot_monitor(&self, slot: usize) -> Option<Arc<dyn SlotMonitor>> {
        self.0.iter().find_map(|o| o.slot_monitor(slot))
    }
}

/// Logs state changes through `tracing`
#[derive(Default)]
pub struct TracingObserver {
    last: Mutex<HashMap<JobId, JobState>>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for TracingObserver {
    fn job_changed(&self, job: &Job) {
        let previous = self.last.lock().insert(job.id, job.state);
        if previous == Some(job.state) {
            return;
        }
        let name = job
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match job.state {
            JobState::Error => warn!(
                job = %job.id,
                file = %name,
                error = job.last_error.as_deref().unwrap_or("unknown"),
                "job failed"
            ),
            JobState::Done => info!(
                job = %job.id,
                file = %name,
                output_bytes = job.stats.output_bytes,
                "job done"
            ),
            state => info!(job = %job.id, file = %name, tier = job.tier.as_str(), %state, "job state"),
        }
    }

    fn slot_monitor(&self, slot: usize) -> Option<Arc<dyn SlotMonitor>> {
        Some(Arc::new(TracingSlotMonitor { slot }))
    }
}

struct TracingSlotMonitor {
    slot: usize,
}

impl SlotMonitor for TracingSlotMonitor {
    fn session_started(&self, job: &Job) {
        debug!(slot = self.slot, job = %job.id, "encode started");
    }

    fn session_progress(&self, job: JobId, snapshot: &ProgressSnapshot) {
        debug!(
            slot = self.slot,
            job = %job,
            progress = snapshot.progress,
            fps = snapshot.fps,
            eta_secs = ?snapshot.eta_secs,
            "encoding"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Observer for Counting {
        fn job_changed(&self, _job: &Job) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct WithMonitor;

    impl Observer for WithMonitor {
        fn slot_monitor(&self, _slot: usize) -> Option<Arc<dyn SlotMonitor>> {
            Some(Arc::new(NullMonitor))
        }
    }

    #[test]
    fn test_null_observer_offers_no_monitor() {
        assert!(NullObserver.slot_monitor(0).is_none());
    }

    #[test]
    fn test_observers_fan_out() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let all = Observers::new().with(a.clone()).with(b.clone()).with(Arc::new(WithMonitor));

        all.job_changed(&Job::new(PathBuf::from("/a.mkv"), 1, 1.0));
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert!(all.slot_monitor(3).is_some());
    }
}

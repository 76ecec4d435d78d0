//! Compute dispatcher
//!
//! Hands `Ready` jobs, in admission order, to a fixed pool of encode slots.
//! A slot is held through a [`SlotLease`] that returns it to the pool when
//! dropped; the lease travels inside the session's completion event so the
//! slot frees only after the coordinator has applied the terminal state.

use crate::job::{CacheHandle, Job, JobId, JobState};
use crate::job_table::JobTable;
use crate::observer::{NullMonitor, Observer, SlotMonitor};
use crate::ram_server::loopback_url;
use crate::session::{run_session, SessionContext, SessionRequest};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed set of encode slot indices `0..capacity`
#[derive(Debug, Clone)]
pub struct SlotPool {
    free: Arc<Mutex<BTreeSet<usize>>>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new((0..capacity).collect())),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Lowest free slot, if any
    pub fn try_acquire(&self) -> Option<SlotLease> {
        let index = self.free.lock().pop_first()?;
        Some(SlotLease {
            index,
            pool: self.free.clone(),
        })
    }
}

/// Exclusive hold on one encode slot
pub struct SlotLease {
    index: usize,
    pool: Arc<Mutex<BTreeSet<usize>>>,
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease").field("index", &self.index).finish()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.lock().insert(self.index);
    }
}

/// Cancellation tokens of running acquisition and encode workers
///
/// Each worker gets a child of the run token, so one job can be stopped
/// alone and a run-wide cancel reaches every worker.
#[derive(Debug, Default)]
pub struct ActiveSessions {
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for `id` and return its token
    pub fn register(&self, id: JobId, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if let Some(old) = self.tokens.lock().insert(id, token.clone()) {
            old.cancel();
        }
        token
    }

    /// Stop one worker; returns whether it was running
    pub fn cancel(&self, id: JobId) -> bool {
        match self.tokens.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, id: JobId) -> bool {
        self.tokens
            .lock()
            .get(&id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn remove(&self, id: JobId) {
        self.tokens.lock().remove(&id);
    }

    pub fn cancel_all(&self) {
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

pub struct Dispatcher {
    table: Arc<JobTable>,
    active: Arc<ActiveSessions>,
    slots: SlotPool,
    session: SessionContext,
    observer: Arc<dyn Observer>,
    /// Port of the loopback byte server
    ram_port: Option<u16>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<JobTable>,
        active: Arc<ActiveSessions>,
        slots: SlotPool,
        session: SessionContext,
        observer: Arc<dyn Observer>,
        ram_port: Option<u16>,
    ) -> Self {
        Self {
            table,
            active,
            slots,
            session,
            observer,
            ram_port,
        }
    }

    /// Fill free slots from `Ready` jobs; returns `(job, slot)` started
    pub fn tick(&self, run_cancel: &CancellationToken) -> Vec<(JobId, usize)> {
        let mut started = Vec::new();
        if run_cancel.is_cancelled() {
            return started;
        }

        while let Some(lease) = self.slots.try_acquire() {
            let claimed = self.table.with_jobs(|jobs| {
                let job = jobs.iter_mut().find(|j| j.state == JobState::Ready)?;
                match job.transition(JobState::Encoding) {
                    Ok(()) => Some(job.clone()),
                    Err(e) => {
                        warn!(error = %e, "could not claim ready job");
                        None
                    }
                }
            });
            // Dropping the lease puts the slot back
            let Some(job) = claimed else { break };

            let slot = lease.index();
            let req = SessionRequest {
                id: job.id,
                source: job.path.clone(),
                input: self.input_for(&job),
                duration_secs: job.duration_secs,
                input_bytes: job.size_bytes,
            };
            let monitor: Arc<dyn SlotMonitor> = self
                .observer
                .slot_monitor(slot)
                .unwrap_or_else(|| Arc::new(NullMonitor));
            monitor.session_started(&job);
            self.observer.job_changed(&job);

            let cancel = self.active.register(job.id, run_cancel);
            debug!(job = %job.id, slot, "dispatched");
            tokio::spawn(run_session(req, self.session.clone(), monitor, lease, cancel));
            started.push((job.id, slot));
        }

        started
    }

    /// Path or URL the encoder reads
    fn input_for(&self, job: &Job) -> String {
        match &job.cache_handle {
            Some(CacheHandle::Ram(token)) => match self.ram_port {
                Some(port) => loopback_url(port, token),
                None => job.path.to_string_lossy().into_owned(),
            },
            Some(CacheHandle::Staged(path)) | Some(CacheHandle::Direct(path)) => {
                path.to_string_lossy().into_owned()
            }
            None => job.path.to_string_lossy().into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_pool_hands_out_lowest_index() {
        let pool = SlotPool::new(3);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        drop(a);
        let c = pool.try_acquire().unwrap();
        assert_eq!(c.index(), 0);
        let d = pool.try_acquire().unwrap();
        assert_eq!(d.index(), 2);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_lease_drop_returns_slot() {
        let pool = SlotPool::new(1);
        {
            let _lease = pool.try_acquire().unwrap();
            assert_eq!(pool.free_count(), 0);
        }
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_active_sessions_child_tokens() {
        let run = CancellationToken::new();
        let active = ActiveSessions::new();
        let a = JobId::new();
        let b = JobId::new();
        let ta = active.register(a, &run);
        let tb = active.register(b, &run);

        assert!(active.cancel(a));
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        assert!(active.is_cancelled(a));

        run.cancel();
        assert!(tb.is_cancelled());

        active.remove(a);
        assert!(!active.cancel(a));
        assert_eq!(active.len(), 1);
    }
}

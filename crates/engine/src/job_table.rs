//! Authoritative job table
//!
//! All job state lives behind one `parking_lot::Mutex`. Callers never hold
//! the lock across an `.await`; multi-step decisions that must be atomic
//! (the RAM reservation) go through [`JobTable::with_jobs`].

use crate::job::{CacheHandle, Job, JobId, JobState, TransitionError};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for admission
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("job already admitted for {0}")]
    Duplicate(PathBuf),
}

/// Number of jobs in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub queued_io: usize,
    pub caching: usize,
    pub ready: usize,
    pub encoding: usize,
    pub done: usize,
    pub error: usize,
    pub stopped: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending
            + self.queued_io
            + self.caching
            + self.ready
            + self.encoding
            + self.done
            + self.error
            + self.stopped
    }

    pub fn terminal(&self) -> usize {
        self.done + self.error + self.stopped
    }
}

/// Pending job as seen by the I/O scheduler
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub id: JobId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub low_latency_source: bool,
}

/// Jobs in admission order
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Mutex<Vec<Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new job in `Pending`; the path is the unique key
    pub fn admit(
        &self,
        path: PathBuf,
        size_bytes: u64,
        duration_secs: f64,
    ) -> Result<JobId, AdmitError> {
        self.insert(Job::new(path, size_bytes, duration_secs))
    }

    /// Admit a job built by the caller
    pub fn insert(&self, job: Job) -> Result<JobId, AdmitError> {
        let mut jobs = self.jobs.lock();
        if jobs.iter().any(|j| j.path == job.path) {
            return Err(AdmitError::Duplicate(job.path));
        }
        let id = job.id;
        jobs.push(job);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    /// Copy of every job, in admission order
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    /// Run `f` with exclusive access to every job
    pub fn with_jobs<R>(&self, f: impl FnOnce(&mut [Job]) -> R) -> R {
        let mut jobs = self.jobs.lock();
        f(&mut jobs)
    }

    /// Run `f` on one job, if it exists
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut jobs = self.jobs.lock();
        jobs.iter_mut().find(|j| j.id == id).map(f)
    }

    /// Apply a state transition, returning the previous state
    pub fn transition(&self, id: JobId, next: JobState) -> Result<JobState, TransitionError> {
        self.update(id, |job| {
            let prev = job.state;
            job.transition(next).map(|_| prev)
        })
        .unwrap_or(Err(TransitionError::UnknownJob(id)))
    }

    /// Monotone progress update; returns the resulting progress
    pub fn advance_progress(&self, id: JobId, value: f64) -> Option<f64> {
        self.update(id, |job| job.advance_progress(value))
    }

    pub fn state_of(&self, id: JobId) -> Option<JobState> {
        self.update(id, |job| job.state)
    }

    /// Bytes of RAM-tier jobs that are not terminal
    pub fn ram_in_use(&self) -> u64 {
        ram_in_use(&self.jobs.lock())
    }

    /// Jobs currently in `QueuedIo` or `Caching`
    pub fn io_in_flight(&self) -> usize {
        io_in_flight(&self.jobs.lock())
    }

    pub fn counts(&self) -> StateCounts {
        let jobs = self.jobs.lock();
        let mut counts = StateCounts::default();
        for job in jobs.iter() {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::QueuedIo => counts.queued_io += 1,
                JobState::Caching => counts.caching += 1,
                JobState::Ready => counts.ready += 1,
                JobState::Encoding => counts.encoding += 1,
                JobState::Done => counts.done += 1,
                JobState::Error => counts.error += 1,
                JobState::Stopped => counts.stopped += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.lock().iter().all(|j| j.state.is_terminal())
    }

    /// `Pending` jobs in admission order
    pub fn pending(&self) -> Vec<PendingJob> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| PendingJob {
                id: j.id,
                path: j.path.clone(),
                size_bytes: j.size_bytes,
                low_latency_source: j.low_latency_source,
            })
            .collect()
    }

    /// Earliest-admitted `Ready` job
    pub fn next_ready(&self) -> Option<Job> {
        self.jobs
            .lock()
            .iter()
            .find(|j| j.state == JobState::Ready)
            .cloned()
    }

    pub fn has_ready(&self) -> bool {
        self.jobs.lock().iter().any(|j| j.state == JobState::Ready)
    }

    /// Reset every job that is not `Done` back to `Pending`
    ///
    /// Returns the cache handles the reset jobs held so the caller can
    /// release them from the cache store.
    pub fn reset_for_restart(&self) -> Vec<(JobId, Option<CacheHandle>)> {
        let mut jobs = self.jobs.lock();
        jobs.iter_mut()
            .filter(|j| j.state != JobState::Done)
            .map(|j| {
                let handle = j.cache_handle.take();
                j.reset();
                (j.id, handle)
            })
            .collect()
    }
}

pub(crate) fn ram_in_use(jobs: &[Job]) -> u64 {
    jobs.iter()
        .filter(|j| j.holds_ram())
        .map(|j| j.size_bytes)
        .sum()
}

pub(crate) fn io_in_flight(jobs: &[Job]) -> usize {
    jobs.iter().filter(|j| j.state.is_io_in_flight()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Tier;

    #[test]
    fn test_admit_rejects_duplicate_path() {
        let table = JobTable::new();
        table.admit(PathBuf::from("/a.mkv"), 10, 1.0).unwrap();
        let err = table.admit(PathBuf::from("/a.mkv"), 10, 1.0).unwrap_err();
        assert_eq!(err, AdmitError::Duplicate(PathBuf::from("/a.mkv")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ram_in_use_counts_only_live_ram_jobs() {
        let table = JobTable::new();
        let a = table.admit(PathBuf::from("/a.mkv"), 100, 1.0).unwrap();
        let b = table.admit(PathBuf::from("/b.mkv"), 200, 1.0).unwrap();
        let c = table.admit(PathBuf::from("/c.mkv"), 400, 1.0).unwrap();

        for id in [a, b] {
            table.update(id, |j| j.tier = Tier::Ram);
            table.transition(id, JobState::QueuedIo).unwrap();
        }
        table.update(c, |j| j.tier = Tier::StagedDisk);
        table.transition(c, JobState::QueuedIo).unwrap();
        assert_eq!(table.ram_in_use(), 300);
        assert_eq!(table.io_in_flight(), 3);

        table.transition(b, JobState::Caching).unwrap();
        table.transition(b, JobState::Error).unwrap();
        assert_eq!(table.ram_in_use(), 100);
    }

    #[test]
    fn test_transition_unknown_job() {
        let table = JobTable::new();
        let id = JobId::new();
        assert_eq!(
            table.transition(id, JobState::Ready),
            Err(TransitionError::UnknownJob(id))
        );
    }

    #[test]
    fn test_next_ready_follows_admission_order() {
        let table = JobTable::new();
        let a = table.admit(PathBuf::from("/a.mkv"), 1, 1.0).unwrap();
        let b = table.admit(PathBuf::from("/b.mkv"), 1, 1.0).unwrap();
        table.transition(b, JobState::Ready).unwrap();
        table.transition(a, JobState::Ready).unwrap();
        assert_eq!(table.next_ready().map(|j| j.id), Some(a));
    }

    #[test]
    fn test_reset_for_restart_keeps_done_jobs() {
        let table = JobTable::new();
        let done = table.admit(PathBuf::from("/done.mkv"), 1, 1.0).unwrap();
        let failed = table.admit(PathBuf::from("/failed.mkv"), 1, 1.0).unwrap();
        for id in [done, failed] {
            table.transition(id, JobState::Ready).unwrap();
            table.transition(id, JobState::Encoding).unwrap();
        }
        table.transition(done, JobState::Done).unwrap();
        table.update(failed, |j| {
            j.cache_handle = Some(CacheHandle::Staged(PathBuf::from("/cache/CACHE_x")))
        });
        table.transition(failed, JobState::Error).unwrap();

        let reset = table.reset_for_restart();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].0, failed);
        assert!(matches!(reset[0].1, Some(CacheHandle::Staged(_))));
        assert_eq!(table.state_of(done), Some(JobState::Done));
        assert_eq!(table.state_of(failed), Some(JobState::Pending));
    }

    #[test]
    fn test_counts() {
        let table = JobTable::new();
        let a = table.admit(PathBuf::from("/a.mkv"), 1, 1.0).unwrap();
        table.admit(PathBuf::from("/b.mkv"), 1, 1.0).unwrap();
        table.transition(a, JobState::Ready).unwrap();
        let counts = table.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.terminal(), 0);
    }
}

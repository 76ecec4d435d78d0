//! Job model for tiercast
//!
//! A job is one source file moving through acquisition and encoding. The
//! state machine here is the only place that decides which transitions are
//! legal; everything else goes through [`Job::transition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier assigned at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in file names and log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, not yet claimed by the I/O scheduler
    Pending,
    /// Claimed for acquisition, worker not yet running
    QueuedIo,
    /// Source is being read into RAM or copied to the staging directory
    Caching,
    /// Input is available, waiting for an encode slot
    Ready,
    /// Held by an encode slot
    Encoding,
    Done,
    Error,
    Stopped,
}

impl JobState {
    /// Convert state to string for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::QueuedIo => "queued_io",
            JobState::Caching => "caching",
            JobState::Ready => "ready",
            JobState::Encoding => "encoding",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Stopped)
    }

    /// True while the job occupies an I/O concurrency slot
    pub fn is_io_in_flight(&self) -> bool {
        matches!(self, JobState::QueuedIo | JobState::Caching)
    }

    /// Whether `self -> next` is an edge of the state machine
    ///
    /// ```text
    /// Pending  -> QueuedIo | Ready
    /// QueuedIo -> Caching
    /// Caching  -> Ready | Error | Stopped
    /// Ready    -> Encoding
    /// Encoding -> Done | Error | Stopped
    /// ```
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, QueuedIo)
                | (Pending, Ready)
                | (QueuedIo, Caching)
                | (Caching, Ready)
                | (Caching, Error)
                | (Caching, Stopped)
                | (Ready, Encoding)
                | (Encoding, Done)
                | (Encoding, Error)
                | (Encoding, Stopped)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acquisition strategy chosen for a job's input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Unassigned,
    /// Encoder reads the original path
    Direct,
    /// Source bytes held in the cache store, served over loopback HTTP
    Ram,
    /// Source copied into the staging directory
    StagedDisk,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Unassigned => "unassigned",
            Tier::Direct => "direct",
            Tier::Ram => "ram",
            Tier::StagedDisk => "staged_disk",
        }
    }
}

/// Where the encoder finds a job's input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheHandle {
    Ram(String),
    Staged(PathBuf),
    Direct(PathBuf),
}

/// Statistics collected while encoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeStats {
    pub fps: f64,
    pub eta_secs: Option<f64>,
    pub compression_ratio: Option<f64>,
    pub output_bytes: u64,
    pub final_path: Option<PathBuf>,
}

/// Error returned for an edge the state machine does not have
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition for job {id}: {from} -> {to}")]
    Illegal {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

/// One source file and everything the scheduler knows about it
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// Source sits on low-seek-latency storage; classified at admission
    pub low_latency_source: bool,
    pub state: JobState,
    pub tier: Tier,
    pub cache_handle: Option<CacheHandle>,
    /// Progress of the active phase, in [0, 1]
    pub progress: f64,
    pub last_error: Option<String>,
    /// Tail of the encoder's output when it failed
    pub diagnostics: Vec<String>,
    pub stats: EncodeStats,
}

impl Job {
    pub fn new(path: PathBuf, size_bytes: u64, duration_secs: f64) -> Self {
        Self {
            id: JobId::new(),
            path,
            size_bytes,
            duration_secs,
            low_latency_source: false,
            state: JobState::Pending,
            tier: Tier::Unassigned,
            cache_handle: None,
            progress: 0.0,
            last_error: None,
            diagnostics: Vec::new(),
            stats: EncodeStats::default(),
        }
    }

    /// Move to `next`, applying the phase progress rules
    ///
    /// Entering `Caching` or `Encoding` starts a new phase at 0; reaching
    /// `Ready` or `Done` pins progress to 1.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                id: self.id,
                from: self.state,
                to: next,
            });
        }

        match next {
            JobState::Caching | JobState::Encoding => self.progress = 0.0,
            JobState::Ready | JobState::Done => self.progress = 1.0,
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Raise progress to `value` (clamped to [0, 1]); never lowers it
    ///
    /// Returns the progress after the update.
    pub fn advance_progress(&mut self, value: f64) -> f64 {
        if value.is_finite() {
            self.progress = self.progress.max(value.clamp(0.0, 1.0));
        }
        self.progress
    }

    /// Whether this job's size counts against the RAM budget
    pub fn holds_ram(&self) -> bool {
        self.tier == Tier::Ram && !self.state.is_terminal()
    }

    /// Return to `Pending` for a new run attempt
    pub(crate) fn reset(&mut self) {
        self.state = JobState::Pending;
        self.tier = Tier::Unassigned;
        self.cache_handle = None;
        self.progress = 0.0;
        self.last_error = None;
        self.diagnostics.clear();
        self.stats = EncodeStats::default();
    }
}

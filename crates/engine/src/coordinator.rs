//! Batch coordinator
//!
//! Owns one batch run: prepares the staging directory, starts the loopback
//! byte server, then alternates between applying worker events to the job
//! table and ticking the I/O scheduler and the compute dispatcher. The loop
//! sleeps at most one tick interval but wakes on every event.

use crate::acquire::{AcquireContext, AcquireSettings};
use crate::cache_store::CacheStore;
use crate::concurrency::effective_workers;
use crate::config::{Config, ConfigError};
use crate::dispatcher::{ActiveSessions, Dispatcher, SlotPool};
use crate::encode::{EncoderInvoker, FfmpegInvoker};
use crate::event::JobEvent;
use crate::io_scheduler::{io_concurrency_for, IoLimits, IoScheduler};
use crate::job::{Job, JobId, JobState, Tier};
use crate::job_table::{AdmitError, JobTable, StateCounts};
use crate::observer::{NullObserver, Observer};
use crate::probe::{DurationProbe, FfprobeDuration};
use crate::ram_server::{RamServer, ServerError};
use crate::resources::{ResourceMonitor, SystemResources};
use crate::scan::InputFile;
use crate::session::{SessionContext, SessionOutcome};
use crate::staging::{clean_orphans, FileReaper, RunMarker};
use crate::startup::{run_startup_checks, StartupError};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the staging directory under the cache root
pub const CACHE_DIR_NAME: &str = "_tiercast_cache_";

/// Capacity of the worker event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for coordinator operations
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("staging directory {path}: {source}")]
    StagingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a run is already in progress")]
    AlreadyRunning,
}

/// A job that ended in `Error`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJob {
    pub path: PathBuf,
    pub error: String,
    /// Last lines the encoder printed, if it got that far
    pub diagnostics: Vec<String>,
}

/// Result of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub counts: StateCounts,
    /// Jobs left non-terminal by a stopped run
    pub unfinished: usize,
    /// Input bytes of `Done` jobs
    pub bytes_in: u64,
    /// Output bytes of `Done` jobs
    pub bytes_out: u64,
    pub failed: Vec<FailedJob>,
}

impl BatchSummary {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut summary = BatchSummary::default();
        for job in jobs {
            match job.state {
                JobState::Pending => summary.counts.pending += 1,
                JobState::QueuedIo => summary.counts.queued_io += 1,
                JobState::Caching => summary.counts.caching += 1,
                JobState::Ready => summary.counts.ready += 1,
                JobState::Encoding => summary.counts.encoding += 1,
                JobState::Done => {
                    summary.counts.done += 1;
                    summary.bytes_in += job.size_bytes;
                    summary.bytes_out += job.stats.output_bytes;
                }
                JobState::Error => {
                    summary.counts.error += 1;
                    summary.failed.push(FailedJob {
                        path: job.path.clone(),
                        error: job.last_error.clone().unwrap_or_default(),
                        diagnostics: job.diagnostics.clone(),
                    });
                }
                JobState::Stopped => summary.counts.stopped += 1,
            }
        }
        summary.unfinished = summary.counts.total() - summary.counts.terminal();
        summary
    }

    pub fn failures(&self) -> usize {
        self.counts.error
    }

    /// A run succeeds when no job ended in `Error`
    pub fn is_success(&self) -> bool {
        self.counts.error == 0
    }

    /// Space saved by `Done` jobs, in percent of their input size
    pub fn saved_percent(&self) -> Option<f64> {
        if self.bytes_in == 0 {
            return None;
        }
        Some((1.0 - self.bytes_out as f64 / self.bytes_in as f64) * 100.0)
    }
}

/// Staging directory prepared for one run
struct Staging {
    marker: RunMarker,
    orphans: usize,
    low_latency: bool,
}

/// Create the directory and this run's marker, then clear dead runs' files
fn prepare_staging(
    dir: &Path,
    run_id: &str,
    resources: &dyn ResourceMonitor,
) -> Result<Staging, RunError> {
    let staging_err = |source| RunError::StagingDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(staging_err)?;
    let marker = RunMarker::create(dir, run_id).map_err(staging_err)?;
    let orphans = clean_orphans(dir);
    Ok(Staging {
        marker,
        orphans,
        low_latency: resources.is_low_latency_disk(dir),
    })
}

/// Clears the running flag when a run ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Coordinator {
    config: Config,
    table: Arc<JobTable>,
    store: Arc<CacheStore>,
    active: Arc<ActiveSessions>,
    resources: Arc<dyn ResourceMonitor>,
    invoker: Arc<dyn EncoderInvoker>,
    probe: Arc<dyn DurationProbe>,
    observer: Arc<dyn Observer>,
    worker_count: AtomicUsize,
    run_cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl Coordinator {
    /// Coordinator with system resources, ffmpeg and ffprobe, and no checks
    pub fn new(config: Config) -> Self {
        let workers = effective_workers(&config);
        let probe = FfprobeDuration::new(config.encoder.probe_program.clone());
        Self {
            table: Arc::new(JobTable::new()),
            store: Arc::new(CacheStore::new()),
            active: Arc::new(ActiveSessions::new()),
            resources: Arc::new(SystemResources::new()),
            invoker: Arc::new(FfmpegInvoker),
            probe: Arc::new(probe),
            observer: Arc::new(NullObserver),
            worker_count: AtomicUsize::new(workers.max(1)),
            run_cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            config,
        }
    }

    /// Run the startup checks, then build as [`Coordinator::new`]
    pub fn with_checks(config: Config) -> Result<Self, RunError> {
        run_startup_checks(&config)?;
        Ok(Self::new(config))
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceMonitor>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn EncoderInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DurationProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &Arc<JobTable> {
        &self.table
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.table.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    /// Takes effect at the next run
    pub fn set_worker_count(&self, workers: usize) {
        self.worker_count.store(workers.max(1), Ordering::SeqCst);
    }

    /// `<cache_root>/_tiercast_cache_`
    pub fn cache_dir(&self) -> PathBuf {
        self.config.io.resolved_cache_root().join(CACHE_DIR_NAME)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Admit one file, probing its duration and classifying its disk
    ///
    /// Blocks on both probes; call from a blocking context.
    pub fn admit(&self, path: PathBuf, size_bytes: u64) -> Result<JobId, AdmitError> {
        let duration = self.probe.duration_secs(&path);
        let mut job = Job::new(path, size_bytes, duration);
        job.low_latency_source = self.resources.is_low_latency_disk(&job.path);
        let low_latency = job.low_latency_source;
        let id = self.table.insert(job)?;
        if let Some(job) = self.table.get(id) {
            debug!(job = %id, path = %job.path.display(), size_bytes, duration, low_latency, "admitted");
            self.observer.job_changed(&job);
        }
        Ok(id)
    }

    /// Admit discovered inputs in order, skipping duplicates
    pub fn admit_inputs(&self, inputs: Vec<InputFile>) -> Vec<JobId> {
        inputs
            .into_iter()
            .filter_map(|input| match self.admit(input.path, input.size_bytes) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "skipping input");
                    None
                }
            })
            .collect()
    }

    /// Stop one job's acquisition or encode; returns whether it was running
    pub fn stop_job(&self, id: JobId) -> bool {
        let stopped = self.active.cancel(id);
        if stopped {
            info!(job = %id, "stop requested");
        }
        stopped
    }

    /// Stop the current run; workers finish as `Stopped`
    pub fn stop(&self) {
        info!("stopping run");
        self.run_cancel.lock().cancel();
        self.active.cancel_all();
    }

    /// Reset every job that is not `Done` to `Pending` for another run
    ///
    /// Releases the caches those jobs held. Returns the number of jobs reset.
    pub fn restart(&self) -> Result<usize, RunError> {
        if self.is_running() {
            return Err(RunError::AlreadyRunning);
        }
        let reset = self.table.reset_for_restart();
        for (id, _handle) in &reset {
            self.store.release(*id);
        }
        *self.run_cancel.lock() = CancellationToken::new();
        for job in self.table.snapshot() {
            self.observer.job_changed(&job);
        }
        info!(jobs = reset.len(), "run reset");
        Ok(reset.len())
    }

    /// Run until every job is terminal, or until stopped and all workers
    /// have reported back
    pub async fn run(&self) -> Result<BatchSummary, RunError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let cancel = self.run_cancel.lock().clone();
        let cfg = &self.config;

        let run_id = run_id();
        let cache_dir = self.cache_dir();
        let staging = {
            let (dir, run, resources) = (cache_dir.clone(), run_id.clone(), self.resources.clone());
            tokio::task::spawn_blocking(move || prepare_staging(&dir, &run, resources.as_ref()))
                .await
                .map_err(|e| RunError::StagingDir {
                    path: cache_dir.clone(),
                    source: std::io::Error::other(e),
                })??
        };
        if staging.orphans > 0 {
            info!(count = staging.orphans, dir = %cache_dir.display(), "removed files left by an earlier run");
        }

        let server = RamServer::start(self.store.clone(), cancel.child_token()).await?;
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reaper = FileReaper::spawn();

        let workers = self.worker_count();
        let slots = SlotPool::new(workers);
        let limits = IoLimits {
            io_concurrency: io_concurrency_for(staging.low_latency, workers),
            ram_budget: cfg.memory.ram_budget_bytes(),
            max_single_file: cfg.memory.max_single_file_bytes(),
            stage_low_latency_sources: cfg.io.stage_low_latency_sources,
        };
        info!(
            jobs = self.table.len(),
            workers,
            io_concurrency = limits.io_concurrency,
            ram_budget_bytes = limits.ram_budget,
            cache_dir = %cache_dir.display(),
            run = %run_id,
            "run started"
        );

        let io = IoScheduler::new(
            self.table.clone(),
            self.active.clone(),
            AcquireContext {
                store: self.store.clone(),
                resources: self.resources.clone(),
                settings: AcquireSettings::from_config(cfg),
                events: tx.clone(),
            },
            limits,
            cache_dir.clone(),
            run_id.clone(),
        );
        let dispatcher = Dispatcher::new(
            self.table.clone(),
            self.active.clone(),
            slots.clone(),
            SessionContext {
                invoker: self.invoker.clone(),
                encoder: cfg.encoder.clone(),
                work_dir: cache_dir.clone(),
                run_id,
                events: tx,
            },
            self.observer.clone(),
            Some(server.port()),
        );

        let tick = Duration::from_millis(cfg.scheduler.tick_interval_ms.max(1));
        loop {
            while let Ok(event) = rx.try_recv() {
                self.apply(event, &reaper);
            }

            if !cancel.is_cancelled() {
                // Spare encode capacity: do not stall waiting for memory
                let no_wait =
                    cfg.scheduler.no_wait || (slots.free_count() > 0 && !self.table.has_ready());
                let io_tick = io.tick(no_wait, &cancel);
                for id in io_tick.direct.iter().chain(io_tick.started.iter().map(|(id, _)| id)) {
                    self.notify(*id);
                }
                dispatcher.tick(&cancel);
            }

            if self.table.all_terminal() || (cancel.is_cancelled() && self.active.is_empty()) {
                break;
            }

            match tokio::time::timeout(tick, rx.recv()).await {
                Ok(Some(event)) => self.apply(event, &reaper),
                Ok(None) => break,
                Err(_) => {}
            }
        }

        drop(rx);
        server.shutdown().await;
        for path in self.store.detach_all() {
            reaper.remove(path);
        }
        reaper.finish().await;
        let marker = staging.marker;
        let _ = tokio::task::spawn_blocking(move || drop(marker)).await;
        // Fails while another run still uses the directory
        let _ = tokio::fs::remove_dir(&cache_dir).await;

        let summary = BatchSummary::from_jobs(&self.table.snapshot());
        info!(
            done = summary.counts.done,
            failed = summary.failures(),
            stopped = summary.counts.stopped,
            unfinished = summary.unfinished,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            saved_percent = summary.saved_percent().unwrap_or(0.0),
            "run finished"
        );
        for failure in &summary.failed {
            warn!(path = %failure.path.display(), error = %failure.error, "failed");
        }
        self.observer.batch_finished(&summary);
        Ok(summary)
    }

    /// Apply one worker event to the job table
    fn apply(&self, event: JobEvent, reaper: &FileReaper) {
        let id = event.job_id();
        match event {
            JobEvent::CacheStarted { .. } => self.transition(id, JobState::Caching),
            JobEvent::CacheProgress { progress, .. } => {
                self.table.update(id, |job| {
                    if job.state == JobState::Caching {
                        job.advance_progress(progress);
                    }
                });
            }
            JobEvent::TierFallback { reason, .. } => {
                debug!(job = %id, %reason, "tier fallback");
                self.table.update(id, |job| job.tier = Tier::StagedDisk);
            }
            JobEvent::CacheReady { handle, .. } => {
                // A stop that raced the last chunk still wins
                if self.active.is_cancelled(id) {
                    self.release(id, reaper);
                    self.transition(id, JobState::Stopped);
                } else {
                    self.table.update(id, |job| job.cache_handle = Some(handle));
                    self.transition(id, JobState::Ready);
                }
                self.active.remove(id);
            }
            JobEvent::CacheFailed { reason, .. } => {
                self.table.update(id, |job| job.last_error = Some(reason));
                self.transition(id, JobState::Error);
                self.release(id, reaper);
                self.active.remove(id);
            }
            JobEvent::CacheStopped { .. } => {
                self.transition(id, JobState::Stopped);
                self.release(id, reaper);
                self.active.remove(id);
            }
            JobEvent::EncodeProgress { snapshot, .. } => {
                self.table.update(id, |job| {
                    if job.state == JobState::Encoding {
                        job.advance_progress(snapshot.progress);
                        job.stats.fps = snapshot.fps;
                        job.stats.eta_secs = snapshot.eta_secs;
                        job.stats.compression_ratio = snapshot.compression_ratio;
                        job.stats.output_bytes = snapshot.output_bytes;
                    }
                });
            }
            JobEvent::EncodeFinished { outcome, lease, .. } => {
                let next = match outcome {
                    SessionOutcome::Success {
                        output_bytes,
                        final_path,
                    } => {
                        self.table.update(id, |job| {
                            job.stats.output_bytes = output_bytes;
                            job.stats.final_path = final_path;
                            job.stats.eta_secs = Some(0.0);
                        });
                        JobState::Done
                    }
                    SessionOutcome::Failure { error, diagnostics } => {
                        if !diagnostics.is_empty() {
                            warn!(job = %id, output = %diagnostics.join("\n"), "encoder output");
                        }
                        self.table.update(id, |job| {
                            job.last_error = Some(error);
                            job.diagnostics = diagnostics;
                        });
                        JobState::Error
                    }
                    SessionOutcome::Stopped => JobState::Stopped,
                };
                self.transition(id, next);
                self.release(id, reaper);
                self.active.remove(id);
                self.notify(id);
                // The slot frees only once the terminal state is visible
                drop(lease);
                return;
            }
        }
        self.notify(id);
    }

    /// Free a job's cache; a staged file is deleted off this task
    fn release(&self, id: JobId, reaper: &FileReaper) {
        if let Some(Some(path)) = self.store.detach(id) {
            reaper.remove(path);
        }
    }

    fn transition(&self, id: JobId, next: JobState) {
        if let Err(e) = self.table.transition(id, next) {
            warn!(error = %e, "ignored state change");
        }
    }

    fn notify(&self, id: JobId) {
        if let Some(job) = self.table.get(id) {
            self.observer.job_changed(&job);
        }
    }
}

fn run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

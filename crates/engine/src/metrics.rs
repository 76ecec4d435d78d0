//! Metrics module for tiercast
//!
//! Keeps a JSON-serializable status snapshot of the batch, fed by
//! [`MetricsObserver`] and served by the metrics HTTP server.

use crate::coordinator::BatchSummary;
use crate::job::{Job, JobState, Tier};
use crate::job_table::StateCounts;
use crate::observer::Observer;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-job status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub stage: JobState,
    pub tier: Tier,
    pub progress: f64,
    pub fps: f64,
    pub eta_secs: Option<f64>,
    pub compression_ratio: Option<f64>,
    pub size_bytes: u64,
    pub output_bytes: u64,
    pub last_error: Option<String>,
    /// Encoder output tail of a failed encode
    pub diagnostics: Vec<String>,
}

impl From<&Job> for JobMetrics {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            input_path: job.path.to_string_lossy().into_owned(),
            stage: job.state,
            tier: job.tier,
            progress: job.progress,
            fps: job.stats.fps,
            eta_secs: job.stats.eta_secs,
            compression_ratio: job.stats.compression_ratio,
            size_bytes: job.size_bytes,
            output_bytes: job.stats.output_bytes,
            last_error: job.last_error.clone(),
            diagnostics: job.diagnostics.clone(),
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub free_ram_gb: f64,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Jobs in admission order
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub counts: StateCounts,
    pub workers: usize,
    pub ram_budget_bytes: u64,
    /// Sizes of live RAM-tier jobs
    pub ram_in_use_bytes: u64,
    /// Input bytes of `Done` jobs
    pub bytes_in: u64,
    /// Output bytes of `Done` jobs
    pub bytes_out: u64,
    /// Set once the batch has finished
    pub finished: bool,
}

impl MetricsSnapshot {
    fn recount(&mut self) {
        let mut counts = StateCounts::default();
        let mut bytes_in = 0;
        let mut bytes_out = 0;
        for job in &self.jobs {
            match job.stage {
                JobState::Pending => counts.pending += 1,
                JobState::QueuedIo => counts.queued_io += 1,
                JobState::Caching => counts.caching += 1,
                JobState::Ready => counts.ready += 1,
                JobState::Encoding => counts.encoding += 1,
                JobState::Done => {
                    counts.done += 1;
                    bytes_in += job.size_bytes;
                    bytes_out += job.output_bytes;
                }
                JobState::Error => counts.error += 1,
                JobState::Stopped => counts.stopped += 1,
            }
        }
        self.counts = counts;
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
    }
}

/// Shared metrics state
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Observer keeping a [`SharedMetrics`] current
pub struct MetricsObserver {
    metrics: SharedMetrics,
}

impl MetricsObserver {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Record the run's slot count and RAM budget
    pub fn set_limits(&self, workers: usize, ram_budget_bytes: u64) {
        let mut snapshot = self.metrics.write();
        snapshot.workers = workers;
        snapshot.ram_budget_bytes = ram_budget_bytes;
    }
}

impl Observer for MetricsObserver {
    fn job_changed(&self, job: &Job) {
        let entry = JobMetrics::from(job);
        let mut snapshot = self.metrics.write();
        match snapshot.jobs.iter_mut().find(|j| j.id == entry.id) {
            Some(existing) => *existing = entry,
            None => snapshot.jobs.push(entry),
        }
        snapshot.ram_in_use_bytes = snapshot
            .jobs
            .iter()
            .filter(|j| j.tier == Tier::Ram && !j.stage.is_terminal())
            .map(|j| j.size_bytes)
            .sum();
        snapshot.recount();
        snapshot.timestamp_unix_ms = timestamp_ms();
    }

    fn batch_finished(&self, summary: &BatchSummary) {
        let mut snapshot = self.metrics.write();
        snapshot.counts = summary.counts;
        snapshot.bytes_in = summary.bytes_in;
        snapshot.bytes_out = summary.bytes_out;
        snapshot.finished = true;
        snapshot.timestamp_unix_ms = timestamp_ms();
    }
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        free_ram_gb: crate::config::bytes_to_gb(sys.available_memory()),
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Periodically refresh the system section until `shutdown` fires
pub fn start_system_sampler(
    metrics: SharedMetrics,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let system = match tokio::task::spawn_blocking(collect_system_metrics).await {
                Ok(system) => system,
                Err(_) => break,
            };
            {
                let mut snapshot = metrics.write();
                snapshot.system = system;
                snapshot.timestamp_unix_ms = timestamp_ms();
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

/// Get current timestamp in milliseconds
pub(crate) fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(path: &str, size: u64) -> Job {
        Job::new(PathBuf::from(path), size, 10.0)
    }

    #[test]
    fn test_observer_tracks_jobs_and_counts() {
        let metrics = new_shared_metrics();
        let observer = MetricsObserver::new(metrics.clone());

        let mut a = job("/hdd/a.mkv", 100);
        let b = job("/hdd/b.mkv", 50);
        observer.job_changed(&a);
        observer.job_changed(&b);

        a.tier = Tier::Ram;
        a.transition(JobState::QueuedIo).unwrap();
        observer.job_changed(&a);

        {
            let snapshot = metrics.read();
            assert_eq!(snapshot.jobs.len(), 2);
            assert_eq!(snapshot.jobs[0].stage, JobState::QueuedIo);
            assert_eq!(snapshot.counts.pending, 1);
            assert_eq!(snapshot.counts.queued_io, 1);
            assert_eq!(snapshot.ram_in_use_bytes, 100);
        }

        a.transition(JobState::Caching).unwrap();
        a.transition(JobState::Ready).unwrap();
        a.transition(JobState::Encoding).unwrap();
        a.stats.output_bytes = 40;
        a.transition(JobState::Done).unwrap();
        observer.job_changed(&a);

        let snapshot = metrics.read();
        assert_eq!(snapshot.counts.done, 1);
        assert_eq!(snapshot.bytes_in, 100);
        assert_eq!(snapshot.bytes_out, 40);
        assert_eq!(snapshot.ram_in_use_bytes, 0);
        assert!(snapshot.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_snapshot_serializes_optional_fields_as_null() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.jobs.push(JobMetrics::from(&job("/hdd/a.mkv", 1)));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value["jobs"][0]["eta_secs"].is_null());
        assert_eq!(value["jobs"][0]["stage"], "pending");
        assert_eq!(value["counts"]["pending"], 0);
    }

    #[test]
    fn test_failed_job_exposes_encoder_output() {
        let metrics = new_shared_metrics();
        let observer = MetricsObserver::new(metrics.clone());

        let mut a = job("/hdd/a.mkv", 100);
        a.transition(JobState::Ready).unwrap();
        a.transition(JobState::Encoding).unwrap();
        a.transition(JobState::Error).unwrap();
        a.last_error = Some("encoder failed with exit code: 1".into());
        a.diagnostics = vec!["Unknown encoder 'libx265'".into()];
        observer.job_changed(&a);

        let value = serde_json::to_value(&*observer.metrics().read()).unwrap();
        assert_eq!(value["jobs"][0]["stage"], "error");
        assert_eq!(value["jobs"][0]["diagnostics"][0], "Unknown encoder 'libx265'");
        assert_eq!(value["counts"]["error"], 1);
    }

    #[test]
    fn test_collect_system_metrics_in_range() {
        let system = collect_system_metrics();
        assert!(system.mem_usage_percent >= 0.0 && system.mem_usage_percent <= 100.0);
        assert!(system.free_ram_gb >= 0.0);
    }
}

//! tiercast
//!
//! Batch transcoding scheduler: acquires each source through the cheapest
//! workable I/O tier (direct read, RAM buffer, or staged local copy) and
//! feeds a fixed pool of encoder slots.

pub mod acquire;
pub mod cache_store;
pub mod concurrency;
pub mod coordinator;
pub mod dispatcher;
pub mod encode;
pub mod event;
pub mod io_scheduler;
pub mod job;
pub mod job_table;
pub mod metrics;
pub mod metrics_server;
pub mod observer;
pub mod probe;
pub mod progress;
pub mod promote;
pub mod ram_server;
pub mod resources;
pub mod scan;
pub mod session;
pub mod staging;
pub mod startup;

#[cfg(test)]
pub(crate) mod test_support;

pub use tiercast_config as config;
pub use tiercast_config::Config;
pub use cache_store::CacheStore;
pub use concurrency::{derive_worker_count, effective_workers, WorkerPlan};
pub use coordinator::{BatchSummary, Coordinator, FailedJob, RunError};
pub use dispatcher::{ActiveSessions, SlotLease, SlotPool};
pub use encode::{EncodeError, EncoderInvoker, FfmpegInvoker};
pub use event::JobEvent;
pub use job::{CacheHandle, Job, JobId, JobState, Tier, TransitionError};
pub use job_table::{AdmitError, JobTable, StateCounts};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsObserver, MetricsSnapshot,
    SharedMetrics, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server};
pub use observer::{NullMonitor, NullObserver, Observer, Observers, SlotMonitor, TracingObserver};
pub use probe::{DurationProbe, FfprobeDuration, FixedDuration};
pub use progress::ProgressSnapshot;
pub use ram_server::{loopback_url, RamServer, ServerError};
pub use resources::{ResourceMonitor, StaticResources, SystemResources};
pub use scan::{discover_inputs, InputFile};
pub use session::SessionOutcome;
pub use staging::{clean_orphans, RunMarker};
pub use startup::{check_encoder_available, parse_ffmpeg_version, run_startup_checks, StartupError};

//! CLI entry point for tiercast
//!
//! Discovers inputs, admits them and runs one batch. Exits non-zero when any
//! job ends in error.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tiercast::metrics::start_system_sampler;
use tiercast::{
    discover_inputs, new_shared_metrics, run_metrics_server, BatchSummary, Config, Coordinator,
    MetricsObserver, Observer, Observers, ResourceMonitor, StaticResources, SystemResources,
    TracingObserver,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiskKind {
    /// Low seek latency: sources are read in place
    Ssd,
    /// Seek-sensitive: sources are buffered or staged
    Hdd,
}

/// tiercast - batch transcoding with tiered input acquisition
#[derive(Parser, Debug)]
#[command(name = "tiercast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or directories to encode
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "tiercast.toml")]
    config: PathBuf,

    /// Number of encode slots (0 derives from the CPU count)
    #[arg(short, long)]
    workers: Option<u32>,

    /// Directory the staging directory is created under
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Never wait for free memory; fall back to disk staging at once
    #[arg(long)]
    no_wait: bool,

    /// Encode and measure, but delete the outputs
    #[arg(long)]
    discard_output: bool,

    /// Admit smaller files first
    #[arg(long)]
    sort_by_size: bool,

    /// Serve the status snapshot over HTTP
    #[arg(long)]
    metrics: bool,

    /// Skip startup checks (encoder availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Treat every disk as this kind instead of probing
    #[arg(long, value_enum)]
    assume_disk: Option<DiskKind>,

    /// Report this much free RAM instead of measuring it
    #[arg(long, requires = "assume_disk")]
    assume_free_ram_gb: Option<f64>,
}

impl Args {
    fn apply_to(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.scheduler.workers = workers;
        }
        if let Some(root) = &self.cache_root {
            config.io.cache_root = Some(root.clone());
        }
        config.scheduler.no_wait |= self.no_wait;
        config.scheduler.sort_by_size |= self.sort_by_size;
        config.encoder.discard_output |= self.discard_output;
        config.metrics.enabled |= self.metrics;
    }

    fn resources(&self) -> Arc<dyn ResourceMonitor> {
        match self.assume_disk {
            Some(kind) => {
                let free = self
                    .assume_free_ram_gb
                    .unwrap_or_else(|| SystemResources::new().free_ram_gb());
                Arc::new(StaticResources::new(free, kind == DiskKind::Ssd))
            }
            None => Arc::new(SystemResources::new()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "done: {}  failed: {}  stopped: {}  unfinished: {}",
        summary.counts.done,
        summary.failures(),
        summary.counts.stopped,
        summary.unfinished
    );
    if let Some(saved) = summary.saved_percent() {
        println!(
            "input: {} bytes  output: {} bytes  saved: {:.1}%",
            summary.bytes_in, summary.bytes_out, saved
        );
    }
    for failure in &summary.failed {
        println!("FAILED {}: {}", failure.path.display(), failure.error);
        for line in &failure.diagnostics {
            println!("    {}", line);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "could not load configuration");
            return ExitCode::FAILURE;
        }
    };
    args.apply_to(&mut config);

    let coordinator = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Coordinator::new(config.clone())
    } else {
        match Coordinator::with_checks(config.clone()) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "startup failed");
                return ExitCode::FAILURE;
            }
        }
    };

    let shutdown = CancellationToken::new();
    let mut observers = Observers::new().with(Arc::new(TracingObserver::new()));
    if config.metrics.enabled {
        let observer = MetricsObserver::new(new_shared_metrics());
        observer.set_limits(coordinator.worker_count(), config.memory.ram_budget_bytes());
        let metrics = observer.metrics();
        observers = observers.with(Arc::new(observer) as Arc<dyn Observer>);

        start_system_sampler(metrics.clone(), Duration::from_secs(1), shutdown.clone());
        let addr = config.metrics.addr.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &addr, token).await {
                error!(error = %e, "metrics server stopped");
            }
        });
        info!(addr = %config.metrics.addr, "status snapshot at /metrics");
    }

    let coordinator = Arc::new(
        coordinator
            .with_resources(args.resources())
            .with_observer(Arc::new(observers)),
    );

    let inputs = args.inputs.clone();
    let sort_by_size = config.scheduler.sort_by_size;
    let admitter = coordinator.clone();
    let admitted = tokio::task::spawn_blocking(move || {
        let found = discover_inputs(&inputs, sort_by_size);
        admitter.admit_inputs(found)
    })
    .await;
    match admitted {
        Ok(ids) if ids.is_empty() => {
            warn!("no video files found");
            return ExitCode::SUCCESS;
        }
        Ok(ids) => info!(jobs = ids.len(), workers = coordinator.worker_count(), "inputs admitted"),
        Err(e) => {
            error!(error = %e, "input discovery failed");
            return ExitCode::FAILURE;
        }
    }

    let stopper = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            stopper.stop();
        }
    });

    let result = coordinator.run().await;
    shutdown.cancel();

    match result {
        Ok(summary) => {
            print_summary(&summary);
            if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}

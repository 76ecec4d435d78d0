//! Encoder session
//!
//! Owns one encoder process for one job: runs it into a working file in the
//! staging directory, publishes throttled progress, verifies the output and
//! promotes it. Cancellation always wins over a late success or failure.

use crate::config::EncoderConfig;
use crate::dispatcher::SlotLease;
use crate::encode::{drive_encoder, EncodeError, EncoderExit, EncoderInvoker};
use crate::event::JobEvent;
use crate::job::JobId;
use crate::observer::SlotMonitor;
use crate::progress::ProgressTracker;
use crate::promote::{final_output_path, promote, working_output_path};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal result of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Success {
        output_bytes: u64,
        /// `None` when the output was discarded
        final_path: Option<PathBuf>,
    },
    Failure {
        error: String,
        diagnostics: Vec<String>,
    },
    Stopped,
}

impl SessionOutcome {
    fn failure(error: EncodeError, diagnostics: Vec<String>) -> Self {
        SessionOutcome::Failure {
            error: error.to_string(),
            diagnostics,
        }
    }
}

/// One dispatched job
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub id: JobId,
    /// Original source path; decides the final output location
    pub source: PathBuf,
    /// Path or URL handed to the encoder
    pub input: String,
    pub duration_secs: f64,
    pub input_bytes: u64,
}

/// Shared pieces every session needs
#[derive(Clone)]
pub struct SessionContext {
    pub invoker: Arc<dyn EncoderInvoker>,
    pub encoder: EncoderConfig,
    pub work_dir: PathBuf,
    /// Tags working files so other runs' cleanup leaves them alone
    pub run_id: String,
    pub events: mpsc::Sender<JobEvent>,
}

/// Session task body; always ends with `EncodeFinished` carrying `lease`
pub async fn run_session(
    req: SessionRequest,
    ctx: SessionContext,
    monitor: Arc<dyn SlotMonitor>,
    lease: SlotLease,
    cancel: CancellationToken,
) {
    let id = req.id;
    info!(job = %id, slot = lease.index(), input = %req.input, "encode started");
    let outcome = encode(&req, &ctx, monitor.as_ref(), &cancel).await;
    monitor.session_finished(id, &outcome);
    let _ = ctx
        .events
        .send(JobEvent::EncodeFinished { id, outcome, lease })
        .await;
}

async fn encode(
    req: &SessionRequest,
    ctx: &SessionContext,
    monitor: &dyn SlotMonitor,
    cancel: &CancellationToken,
) -> SessionOutcome {
    let cfg = &ctx.encoder;
    let work = working_output_path(&ctx.work_dir, &ctx.run_id, &cfg.output_extension);
    let cmd = ctx.invoker.command(&req.input, &work, cfg);

    let mut tracker = ProgressTracker::new(req.duration_secs, req.input_bytes, Instant::now());
    let events = ctx.events.clone();
    let id = req.id;
    let on_sample = |sample: &crate::progress::ProgressSample| {
        tracker.observe(sample);
        let now = Instant::now();
        if tracker.should_emit(now) {
            let snapshot = tracker.snapshot(now, sample.output_bytes.unwrap_or(0));
            monitor.session_progress(id, &snapshot);
            let _ = events.try_send(JobEvent::EncodeProgress { id, snapshot });
        }
    };

    let run = drive_encoder(
        cmd,
        cancel,
        Duration::from_millis(cfg.stop_grace_ms),
        cfg.diagnostic_lines,
        on_sample,
    )
    .await;

    let run = match run {
        Ok(run) => run,
        Err(e) => {
            remove_work(&work).await;
            warn!(job = %id, error = %e, "encoder did not start");
            return SessionOutcome::failure(e, Vec::new());
        }
    };

    if matches!(run.exit, EncoderExit::Cancelled) || cancel.is_cancelled() {
        remove_work(&work).await;
        info!(job = %id, "encode stopped");
        return SessionOutcome::Stopped;
    }

    if let Some(e) = run.exit_error() {
        remove_work(&work).await;
        return SessionOutcome::failure(e, run.diagnostics);
    }

    let output_bytes = match tokio::fs::metadata(&work).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            return SessionOutcome::failure(EncodeError::MissingOutput(work), run.diagnostics);
        }
    };
    if output_bytes < cfg.min_output_bytes {
        remove_work(&work).await;
        return SessionOutcome::failure(
            EncodeError::OutputTooSmall {
                size: output_bytes,
                min: cfg.min_output_bytes,
            },
            run.diagnostics,
        );
    }

    if cfg.discard_output {
        remove_work(&work).await;
        debug!(job = %id, output_bytes, "benchmark mode, output discarded");
        return SessionOutcome::Success {
            output_bytes,
            final_path: None,
        };
    }

    // A cross-filesystem promotion copies the whole output
    let dest = final_output_path(&req.source, cfg);
    let promoted = {
        let (work, dest) = (work.clone(), dest.clone());
        tokio::task::spawn_blocking(move || promote(&work, &dest)).await
    };
    let error = match promoted {
        Ok(Ok(())) => {
            return SessionOutcome::Success {
                output_bytes,
                final_path: Some(dest),
            }
        }
        Ok(Err(e)) => EncodeError::Promote(e),
        Err(e) => EncodeError::Io(std::io::Error::other(e)),
    };
    remove_work(&work).await;
    SessionOutcome::failure(error, run.diagnostics)
}

async fn remove_work(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove working file"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dispatcher::SlotPool;
    use crate::observer::NullMonitor;
    use crate::test_support::ShellInvoker;
    use std::fs;
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        source: PathBuf,
        work_dir: PathBuf,
        ctx: SessionContext,
        rx: mpsc::Receiver<JobEvent>,
        pool: SlotPool,
    }

    fn setup(script: &str, discard: bool) -> Setup {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("media").join("film.mkv");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, vec![1u8; 4096]).unwrap();
        let work_dir = dir.path().join("cache");
        fs::create_dir_all(&work_dir).unwrap();

        let (tx, rx) = mpsc::channel(64);
        let encoder = EncoderConfig {
            discard_output: discard,
            stop_grace_ms: 200,
            ..EncoderConfig::default()
        };
        Setup {
            source: source.clone(),
            work_dir: work_dir.clone(),
            ctx: SessionContext {
                invoker: Arc::new(ShellInvoker::new(script)),
                encoder,
                work_dir,
                run_id: "1a2b3c4d".to_string(),
                events: tx,
            },
            rx,
            pool: SlotPool::new(1),
            _dir: dir,
        }
    }

    fn request(source: &Path) -> SessionRequest {
        SessionRequest {
            id: JobId::new(),
            source: source.to_path_buf(),
            input: source.to_string_lossy().into_owned(),
            duration_secs: 10.0,
            input_bytes: 4096,
        }
    }

    async fn finish(mut s: Setup, cancel: CancellationToken) -> (SessionOutcome, Vec<f64>, Setup) {
        let lease = s.pool.try_acquire().unwrap();
        let handle = tokio::spawn(run_session(
            request(&s.source),
            s.ctx.clone(),
            Arc::new(NullMonitor),
            lease,
            cancel,
        ));
        let mut progress = Vec::new();
        let outcome = loop {
            match s.rx.recv().await.unwrap() {
                JobEvent::EncodeProgress { snapshot, .. } => progress.push(snapshot.progress),
                JobEvent::EncodeFinished { outcome, lease, .. } => {
                    drop(lease);
                    break outcome;
                }
                other => panic!("unexpected event {:?}", other),
            }
        };
        handle.await.unwrap();
        (outcome, progress, s)
    }

    #[tokio::test]
    async fn test_success_promotes_next_to_source() {
        let script = r#"echo 'out_time_us=5000000'; echo 'progress=continue'; head -c 2048 "$1" > "$2"; echo 'progress=end'"#;
        let (outcome, progress, s) = finish(setup(script, false), CancellationToken::new()).await;

        let expected = s.source.with_file_name("film_encoded.mp4");
        assert_eq!(
            outcome,
            SessionOutcome::Success {
                output_bytes: 2048,
                final_path: Some(expected.clone())
            }
        );
        assert!(expected.exists());
        assert!(fs::read_dir(&s.work_dir).unwrap().next().is_none());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(s.pool.free_count(), 1);
    }

    // Scenario E: exit code 1 leaves no promoted output and keeps diagnostics
    #[tokio::test]
    async fn test_failure_keeps_diagnostics_and_skips_promotion() {
        let script = r#"head -c 2048 "$1" > "$2"; echo 'Conversion failed!' >&2; exit 1"#;
        let (outcome, _, s) = finish(setup(script, false), CancellationToken::new()).await;

        match outcome {
            SessionOutcome::Failure { error, diagnostics } => {
                assert!(error.contains("exit code: 1"));
                assert_eq!(diagnostics, vec!["Conversion failed!"]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!s.source.with_file_name("film_encoded.mp4").exists());
        assert!(fs::read_dir(&s.work_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_undersized_output_is_failure() {
        let script = r#"printf 'tiny' > "$2""#;
        let (outcome, _, _s) = finish(setup(script, false), CancellationToken::new()).await;
        match outcome {
            SessionOutcome::Failure { error, .. } => assert!(error.contains("too small")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discard_output_reports_size() {
        let script = r#"head -c 3000 "$1" > "$2""#;
        let (outcome, _, s) = finish(setup(script, true), CancellationToken::new()).await;
        assert_eq!(
            outcome,
            SessionOutcome::Success {
                output_bytes: 3000,
                final_path: None
            }
        );
        assert!(!s.source.with_file_name("film_encoded.mp4").exists());
    }

    #[tokio::test]
    async fn test_cancel_reports_stopped_and_removes_work() {
        let script = r#"head -c 2048 "$1" > "$2"; while true; do echo 'progress=continue'; sleep 0.05; done"#;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let (outcome, _, s) = finish(setup(script, false), cancel).await;
        assert_eq!(outcome, SessionOutcome::Stopped);
        assert!(!s.source.with_file_name("film_encoded.mp4").exists());
        assert!(fs::read_dir(&s.work_dir).unwrap().next().is_none());
    }
}

//! Source acquisition workers
//!
//! Reads a source into RAM or copies it into the staging directory in fixed
//! chunks. Cancellation is observed at every chunk boundary. A RAM failure
//! is always retried once as a staged copy; a staged failure is terminal.

use crate::cache_store::CacheStore;
use crate::config::{bytes_to_gb, Config};
use crate::event::JobEvent;
use crate::job::{CacheHandle, JobId, Tier};
use crate::resources::ResourceMonitor;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of staged copies in the staging directory
pub const STAGED_PREFIX: &str = "CACHE_";

/// Error type for acquisition
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Recoverable: the caller falls back to disk staging
    #[error("RAM acquisition failed: {0}")]
    Ram(String),

    /// Terminal for the job
    #[error("staging copy failed: {0}")]
    Staged(#[source] std::io::Error),

    #[error("acquisition cancelled")]
    Cancelled,
}

/// Chunk sizes and RAM wait policy
#[derive(Debug, Clone)]
pub struct AcquireSettings {
    pub ram_chunk: usize,
    pub disk_chunk: usize,
    pub safe_reserve_gb: f64,
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
}

impl AcquireSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ram_chunk: cfg.io.ram_chunk_bytes(),
            disk_chunk: cfg.io.disk_chunk_bytes(),
            safe_reserve_gb: cfg.memory.safe_ram_reserve_gb,
            wait_timeout: Duration::from_secs(cfg.memory.ram_wait_timeout_secs),
            wait_interval: Duration::from_millis(cfg.memory.ram_wait_interval_ms.max(1)),
        }
    }
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One claimed job handed to an acquisition worker
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub id: JobId,
    pub source: PathBuf,
    pub size_bytes: u64,
    pub tier: Tier,
    /// Skip the bounded wait for free memory
    pub no_wait: bool,
    /// Destination if the job ends up staged
    pub staged_dest: PathBuf,
}

/// Staged file name: `CACHE_<run-id>_<job-id>_<file name>`
pub fn staged_file_name(run_id: &str, job: JobId, source: &Path) -> String {
    let fname = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    format!("{}{}_{}_{}", STAGED_PREFIX, run_id, job.short(), fname)
}

/// Wait until `free_ram - safe_reserve > size` or the timeout passes
///
/// Returns whether enough memory is available. With `no_wait` the check is
/// made once.
pub async fn wait_for_ram(
    resources: &dyn ResourceMonitor,
    size_bytes: u64,
    settings: &AcquireSettings,
    no_wait: bool,
    cancel: &CancellationToken,
) -> Result<bool, AcquireError> {
    let size_gb = bytes_to_gb(size_bytes);
    let deadline = Instant::now() + settings.wait_timeout;
    let mut announced = false;

    loop {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        let available = resources.free_ram_gb() - settings.safe_reserve_gb;
        if available > size_gb {
            return Ok(true);
        }
        if no_wait || Instant::now() >= deadline {
            return Ok(false);
        }
        if !announced {
            debug!(available_gb = available, needed_gb = size_gb, "waiting for memory");
            announced = true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            _ = tokio::time::sleep(settings.wait_interval) => {}
        }
    }
}

/// Read `source` into one buffer, `chunk` bytes at a time
pub async fn read_into_ram(
    source: &Path,
    size_hint: u64,
    chunk: usize,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(f64),
) -> Result<Bytes, AcquireError> {
    let mut file = File::open(source)
        .await
        .map_err(|e| AcquireError::Ram(format!("open {}: {}", source.display(), e)))?;

    let mut buffer: Vec<u8> = Vec::new();
    buffer
        .try_reserve_exact(size_hint as usize)
        .map_err(|e| AcquireError::Ram(format!("allocation of {} bytes failed: {}", size_hint, e)))?;

    let mut scratch = vec![0u8; chunk.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        let n = read_chunk(&mut file, &mut scratch)
            .await
            .map_err(|e| AcquireError::Ram(format!("read {}: {}", source.display(), e)))?;
        if n == 0 {
            break;
        }
        buffer
            .try_reserve(n)
            .map_err(|e| AcquireError::Ram(format!("allocation failed: {}", e)))?;
        buffer.extend_from_slice(&scratch[..n]);
        if size_hint > 0 {
            on_progress(buffer.len() as f64 / size_hint as f64);
        }
    }

    Ok(Bytes::from(buffer))
}

/// Copy `source` to `dest`, `chunk` bytes at a time
///
/// The partial destination is removed on cancellation or error.
pub async fn stage_to_disk(
    source: &Path,
    dest: &Path,
    size_hint: u64,
    chunk: usize,
    cancel: &CancellationToken,
    on_progress: impl FnMut(f64),
) -> Result<u64, AcquireError> {
    let result = copy_chunked(source, dest, size_hint, chunk, cancel, on_progress).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(dest).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dest.display(), error = %e, "failed to remove partial staged file");
            }
        }
    }
    result
}

async fn copy_chunked(
    source: &Path,
    dest: &Path,
    size_hint: u64,
    chunk: usize,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(f64),
) -> Result<u64, AcquireError> {
    let mut src = File::open(source).await.map_err(AcquireError::Staged)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(AcquireError::Staged)?;
    }
    let mut dst = File::create(dest).await.map_err(AcquireError::Staged)?;

    let mut scratch = vec![0u8; chunk.max(1)];
    let mut copied: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        let n = read_chunk(&mut src, &mut scratch)
            .await
            .map_err(AcquireError::Staged)?;
        if n == 0 {
            break;
        }
        dst.write_all(&scratch[..n])
            .await
            .map_err(AcquireError::Staged)?;
        copied += n as u64;
        if size_hint > 0 {
            on_progress(copied as f64 / size_hint as f64);
        }
    }
    dst.flush().await.map_err(AcquireError::Staged)?;
    dst.sync_all().await.map_err(AcquireError::Staged)?;
    Ok(copied)
}

/// Fill `buf` as far as the file allows; returns bytes read (0 at EOF)
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Shared pieces an acquisition worker needs
#[derive(Clone)]
pub struct AcquireContext {
    pub store: Arc<CacheStore>,
    pub resources: Arc<dyn ResourceMonitor>,
    pub settings: AcquireSettings,
    pub events: mpsc::Sender<JobEvent>,
}

/// Acquisition worker body
///
/// Publishes `CacheStarted`, progress, and exactly one of `CacheReady`,
/// `CacheFailed` or `CacheStopped`.
pub async fn run_acquisition(req: AcquireRequest, ctx: AcquireContext, cancel: CancellationToken) {
    let id = req.id;
    let _ = ctx.events.send(JobEvent::CacheStarted { id }).await;

    // Progress snapshots are best effort; a full channel drops them
    let progress_tx = ctx.events.clone();
    let report = move |progress: f64| {
        let _ = progress_tx.try_send(JobEvent::CacheProgress { id, progress });
    };

    if req.tier == Tier::Ram {
        match acquire_ram(&req, &ctx, &cancel, report.clone()).await {
            Ok(data) => {
                if cancel.is_cancelled() {
                    let _ = ctx.events.send(JobEvent::CacheStopped { id }).await;
                    return;
                }
                let bytes = data.len();
                let token = ctx.store.put_bytes(id, data);
                info!(job = %id, bytes, "source held in RAM");
                let _ = ctx
                    .events
                    .send(JobEvent::CacheReady {
                        id,
                        handle: CacheHandle::Ram(token),
                    })
                    .await;
                return;
            }
            Err(AcquireError::Cancelled) => {
                let _ = ctx.events.send(JobEvent::CacheStopped { id }).await;
                return;
            }
            Err(e) => {
                warn!(job = %id, error = %e, "RAM acquisition failed, staging to disk");
                let _ = ctx
                    .events
                    .send(JobEvent::TierFallback {
                        id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        }
    }

    let result = stage_to_disk(
        &req.source,
        &req.staged_dest,
        req.size_bytes,
        ctx.settings.disk_chunk,
        &cancel,
        report,
    )
    .await;

    let event = match result {
        Ok(_) if cancel.is_cancelled() => {
            let _ = tokio::fs::remove_file(&req.staged_dest).await;
            JobEvent::CacheStopped { id }
        }
        Ok(copied) => {
            ctx.store.put_staged_file(id, req.staged_dest.clone());
            info!(job = %id, bytes = copied, path = %req.staged_dest.display(), "source staged");
            JobEvent::CacheReady {
                id,
                handle: CacheHandle::Staged(req.staged_dest.clone()),
            }
        }
        Err(AcquireError::Cancelled) => JobEvent::CacheStopped { id },
        Err(e) => JobEvent::CacheFailed {
            id,
            reason: e.to_string(),
        },
    };
    let _ = ctx.events.send(event).await;
}

async fn acquire_ram(
    req: &AcquireRequest,
    ctx: &AcquireContext,
    cancel: &CancellationToken,
    report: impl FnMut(f64),
) -> Result<Bytes, AcquireError> {
    let enough = wait_for_ram(
        ctx.resources.as_ref(),
        req.size_bytes,
        &ctx.settings,
        req.no_wait,
        cancel,
    )
    .await?;
    if !enough {
        return Err(AcquireError::Ram("not enough free memory".to_string()));
    }
    read_into_ram(&req.source, req.size_bytes, ctx.settings.ram_chunk, cancel, report).await
}

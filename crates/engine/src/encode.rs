//! Encoder invocation for tiercast
//!
//! Builds the encoder command and drives the child process: reads the
//! progress stream, keeps the tail of its output for diagnostics, and stops
//! it cooperatively (`q` on stdin) before killing it.

use crate::config::EncoderConfig;
use crate::progress::{parse_progress_pair, split_key_value, ProgressSample};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::promote::PromoteError;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder could not be started
    #[error("failed to launch encoder: {0}")]
    Spawn(#[source] std::io::Error),

    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code: {0}")]
    ExitCode(i32),

    /// Encoder was terminated by signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("encoder output too small: {size} bytes (minimum {min})")]
    OutputTooSmall { size: u64, min: u64 },

    #[error("could not move output into place: {0}")]
    Promote(#[from] PromoteError),

    /// IO error while driving the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the command that encodes `input` into `output`
pub trait EncoderInvoker: Send + Sync {
    fn command(&self, input: &str, output: &Path, config: &EncoderConfig) -> Command;
}

/// Invokes ffmpeg with progress reporting on stdout
///
/// `config.args` are passed through between the input and the output.
#[derive(Debug, Clone, Default)]
pub struct FfmpegInvoker;

impl EncoderInvoker for FfmpegInvoker {
    fn command(&self, input: &str, output: &Path, config: &EncoderConfig) -> Command {
        let mut cmd = Command::new(&config.program);
        cmd.arg("-hide_banner").arg("-y");
        cmd.arg("-progress").arg("pipe:1").arg("-nostats");
        cmd.arg("-i").arg(input);
        cmd.args(&config.args);
        cmd.arg(output);
        cmd
    }
}

/// Last `capacity` lines of encoder output
#[derive(Debug, Clone)]
pub struct Diagnostics {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() || self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// How the encoder run ended
#[derive(Debug)]
pub enum EncoderExit {
    Exited(ExitStatus),
    /// Stopped on request; the status is not meaningful
    Cancelled,
}

#[derive(Debug)]
pub struct EncoderRun {
    pub exit: EncoderExit,
    pub diagnostics: Vec<String>,
}

impl EncoderRun {
    /// Map a non-success exit to the matching error
    pub fn exit_error(&self) -> Option<EncodeError> {
        match &self.exit {
            EncoderExit::Exited(status) if status.success() => None,
            EncoderExit::Exited(status) => Some(match status.code() {
                Some(code) => EncodeError::ExitCode(code),
                None => EncodeError::Terminated,
            }),
            EncoderExit::Cancelled => None,
        }
    }
}

/// Run `cmd` to completion or cancellation
///
/// `on_sample` is called once per completed progress block. Cancellation is
/// checked between every line read.
pub async fn drive_encoder(
    mut cmd: Command,
    cancel: &CancellationToken,
    stop_grace: Duration,
    diagnostic_lines: usize,
    mut on_sample: impl FnMut(&ProgressSample),
) -> Result<EncoderRun, EncodeError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
    let mut diagnostics = Diagnostics::new(diagnostic_lines);

    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut sample = ProgressSample::default();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_child(&mut child, stop_grace).await;
                return Ok(EncoderRun {
                    exit: EncoderExit::Cancelled,
                    diagnostics: diagnostics.into_lines(),
                });
            }
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => match split_key_value(&line) {
                    Some((key, value)) => {
                        if sample.apply(parse_progress_pair(key, value)) {
                            on_sample(&sample);
                        }
                    }
                    None => diagnostics.push(&line),
                },
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => diagnostics.push(&line),
                None => stderr = None,
            },
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            stop_child(&mut child, stop_grace).await;
            return Ok(EncoderRun {
                exit: EncoderExit::Cancelled,
                diagnostics: diagnostics.into_lines(),
            });
        }
    };

    debug!(?status, "encoder exited");
    Ok(EncoderRun {
        exit: EncoderExit::Exited(status),
        diagnostics: diagnostics.into_lines(),
    })
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

async fn next_line<R: tokio::io::AsyncRead + Unpin>(reader: &mut Option<Lines<R>>) -> Option<String> {
    match reader {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// Ask the encoder to quit, then kill it after `grace`
async fn stop_child(child: &mut Child, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("encoder ignored quit request, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill encoder");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_ffmpeg_command_layout() {
        let cfg = EncoderConfig::default();
        let cmd = FfmpegInvoker.command("http://127.0.0.1:9/abc", Path::new("/cache/TEMP_ENC_1.mp4"), &cfg);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "ffmpeg");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(2).any(|w| w[0] == "-progress" && w[1] == "pipe:1"));
        assert!(args.contains(&"-nostats".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "http://127.0.0.1:9/abc"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert_eq!(args.last().map(String::as_str), Some("/cache/TEMP_ENC_1.mp4"));
    }

    #[test]
    fn test_diagnostics_keeps_tail() {
        let mut diag = Diagnostics::new(3);
        for i in 0..10 {
            diag.push(&format!("line {}", i));
        }
        diag.push("   ");
        assert_eq!(diag.into_lines(), vec!["line 7", "line 8", "line 9"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drive_encoder_reads_progress_blocks() {
        let script = "echo 'fps=30'; echo 'out_time_us=1000000'; echo 'progress=continue'; \
                      echo 'out_time_us=2000000'; echo 'progress=end'; echo 'muxing done' >&2";
        let mut positions = Vec::new();
        let run = drive_encoder(
            sh(script),
            &CancellationToken::new(),
            Duration::from_secs(1),
            30,
            |s| positions.push(s.position_secs),
        )
        .await
        .unwrap();

        assert!(run.exit_error().is_none());
        assert_eq!(positions, vec![Some(1.0), Some(2.0)]);
        assert_eq!(run.diagnostics, vec!["muxing done"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drive_encoder_non_zero_exit() {
        let run = drive_encoder(
            sh("echo 'Invalid data found' >&2; exit 1"),
            &CancellationToken::new(),
            Duration::from_secs(1),
            30,
            |_| {},
        )
        .await
        .unwrap();
        assert!(matches!(run.exit_error(), Some(EncodeError::ExitCode(1))));
        assert_eq!(run.diagnostics, vec!["Invalid data found"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drive_encoder_cancel_kills_after_grace() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        // Ignores stdin, so only the kill ends it
        let run = drive_encoder(sh("sleep 30"), &cancel, Duration::from_millis(200), 30, |_| {})
            .await
            .unwrap();
        assert!(matches!(run.exit, EncoderExit::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = drive_encoder(
            Command::new("/nonexistent/encoder"),
            &CancellationToken::new(),
            Duration::from_secs(1),
            30,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn(_)));
    }
}

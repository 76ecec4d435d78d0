//! Duration probing for admitted files.
//!
//! Progress math divides by the duration, so every failure degrades to
//! [`DEFAULT_DURATION_SECS`] instead of surfacing an error.

use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Duration used when probing fails or reports nothing usable.
pub const DEFAULT_DURATION_SECS: f64 = 1.0;

/// Returns the media duration of a file in seconds.
pub trait DurationProbe: Send + Sync {
    fn duration_secs(&self, path: &Path) -> f64;
}

/// Probes with `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    program: String,
}

impl FfprobeDuration {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfprobeDuration {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl DurationProbe for FfprobeDuration {
    fn duration_secs(&self, path: &Path) -> f64 {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output();

        match output {
            Ok(out) if out.status.success() => {
                parse_duration_output(&String::from_utf8_lossy(&out.stdout))
                    .unwrap_or(DEFAULT_DURATION_SECS)
            }
            Ok(out) => {
                debug!(path = %path.display(), status = %out.status, "ffprobe failed");
                DEFAULT_DURATION_SECS
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ffprobe unavailable");
                DEFAULT_DURATION_SECS
            }
        }
    }
}

/// Fixed duration, for tests and for running without ffprobe.
#[derive(Debug, Clone, Copy)]
pub struct FixedDuration(pub f64);

impl DurationProbe for FixedDuration {
    fn duration_secs(&self, _path: &Path) -> f64 {
        if self.0.is_finite() && self.0 > 0.0 {
            self.0
        } else {
            DEFAULT_DURATION_SECS
        }
    }
}

/// Parse the first line of ffprobe output as a positive duration.
pub fn parse_duration_output(stdout: &str) -> Option<f64> {
    let value: f64 = stdout.lines().next()?.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_output() {
        assert_eq!(parse_duration_output("5025.120000\n"), Some(5025.12));
        assert_eq!(parse_duration_output("N/A\n"), None);
        assert_eq!(parse_duration_output("0.000000"), None);
        assert_eq!(parse_duration_output("-3"), None);
        assert_eq!(parse_duration_output(""), None);
    }

    #[test]
    fn test_missing_ffprobe_defaults() {
        let probe = FfprobeDuration::new("/nonexistent/ffprobe");
        assert_eq!(probe.duration_secs(Path::new("/media/a.mkv")), DEFAULT_DURATION_SECS);
    }

    #[test]
    fn test_fixed_duration_rejects_non_positive() {
        assert_eq!(FixedDuration(42.0).duration_secs(Path::new("x")), 42.0);
        assert_eq!(FixedDuration(0.0).duration_secs(Path::new("x")), DEFAULT_DURATION_SECS);
    }
}

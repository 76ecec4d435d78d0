//! Encoder progress parsing and smoothing
//!
//! Parses the `key=value` stream written by `-progress pipe:1` and turns raw
//! positions into a monotone progress value with ETA and a running
//! compression ratio.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Below this progress the ETA is unknown
pub const ETA_MIN_PROGRESS: f64 = 0.005;
/// Below this progress the compression ratio is unknown
pub const RATIO_MIN_PROGRESS: f64 = 0.01;
/// Minimum spacing between published snapshots
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(100);

/// Latest values read from the progress stream
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSample {
    /// Encoded media position, seconds
    pub position_secs: Option<f64>,
    pub fps: Option<f64>,
    /// Bytes written to the output so far (`total_size`)
    pub output_bytes: Option<u64>,
    /// Encoder reported `progress=end`
    pub finished: bool,
}

/// What a progress line means for the sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    Position(f64),
    Fps(f64),
    OutputSize(u64),
    /// `progress=continue|end`: one block is complete
    BlockEnd { finished: bool },
    Ignored,
}

/// Split `key=value`; `None` for lines that are not progress output
pub fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.trim().split_once('=')?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

/// Interpret one `key=value` pair
///
/// `out_time_us` and `out_time_ms` are both microseconds in ffmpeg output;
/// `out_time` is `HH:MM:SS.ffffff`. Negative or `N/A` values are ignored.
/// `total_size` is the output size in bytes.
pub fn parse_progress_pair(key: &str, value: &str) -> ProgressLine {
    match key {
        "out_time_us" | "out_time_ms" => match value.parse::<i64>() {
            Ok(us) if us >= 0 => ProgressLine::Position(us as f64 / 1_000_000.0),
            _ => ProgressLine::Ignored,
        },
        "out_time" => parse_clock(value)
            .map(ProgressLine::Position)
            .unwrap_or(ProgressLine::Ignored),
        "fps" => match value.parse::<f64>() {
            Ok(fps) if fps.is_finite() && fps >= 0.0 => ProgressLine::Fps(fps),
            _ => ProgressLine::Ignored,
        },
        "total_size" => value
            .parse::<u64>()
            .map(ProgressLine::OutputSize)
            .unwrap_or(ProgressLine::Ignored),
        "progress" => ProgressLine::BlockEnd {
            finished: value == "end",
        },
        _ => ProgressLine::Ignored,
    }
}

/// Parse `HH:MM:SS(.frac)` into seconds
pub fn parse_clock(value: &str) -> Option<f64> {
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(h * 3600.0 + m * 60.0 + s)
}

impl ProgressSample {
    /// Fold one line into the sample; returns true at the end of a block
    pub fn apply(&mut self, line: ProgressLine) -> bool {
        match line {
            ProgressLine::Position(p) => self.position_secs = Some(p),
            ProgressLine::Fps(f) => self.fps = Some(f),
            ProgressLine::OutputSize(n) => self.output_bytes = Some(n),
            ProgressLine::BlockEnd { finished } => {
                self.finished = finished;
                return true;
            }
            ProgressLine::Ignored => {}
        }
        false
    }
}

/// Published view of an encode in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub progress: f64,
    pub fps: f64,
    pub eta_secs: Option<f64>,
    pub compression_ratio: Option<f64>,
    pub output_bytes: u64,
}

/// Monotone progress with ETA, ratio and snapshot throttling
#[derive(Debug)]
pub struct ProgressTracker {
    duration_secs: f64,
    input_bytes: u64,
    started: Instant,
    progress: f64,
    fps: f64,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    /// `duration_secs` below or at zero is treated as 1 second
    pub fn new(duration_secs: f64, input_bytes: u64, started: Instant) -> Self {
        let duration_secs = if duration_secs.is_finite() && duration_secs > 0.0 {
            duration_secs
        } else {
            1.0
        };
        Self {
            duration_secs,
            input_bytes,
            started,
            progress: 0.0,
            fps: 0.0,
            last_emit: None,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Fold a sample into the clamped progress; returns the new progress
    pub fn observe(&mut self, sample: &ProgressSample) -> f64 {
        if let Some(fps) = sample.fps {
            self.fps = fps;
        }
        if let Some(position) = sample.position_secs {
            let raw = position / self.duration_secs;
            if raw.is_finite() {
                self.progress = self.progress.max(raw).min(1.0);
            }
        }
        self.progress
    }

    /// `elapsed * (1/progress - 1)` once progress passes the threshold
    pub fn eta_secs(&self, now: Instant) -> Option<f64> {
        if self.progress <= ETA_MIN_PROGRESS {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        Some(elapsed * (1.0 / self.progress - 1.0))
    }

    /// `output / (input * progress)` once progress passes the threshold
    pub fn compression_ratio(&self, output_bytes: u64) -> Option<f64> {
        if self.progress <= RATIO_MIN_PROGRESS || self.input_bytes == 0 {
            return None;
        }
        Some(output_bytes as f64 / (self.input_bytes as f64 * self.progress))
    }

    /// Whether a snapshot may be published at `now`
    ///
    /// Marks the emission when it returns true.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < SNAPSHOT_INTERVAL => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn snapshot(&self, now: Instant, output_bytes: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            progress: self.progress,
            fps: self.fps,
            eta_secs: self.eta_secs(now),
            compression_ratio: self.compression_ratio(output_bytes),
            output_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_progress_pairs() {
        assert_eq!(parse_progress_pair("out_time_us", "5000000"), ProgressLine::Position(5.0));
        assert_eq!(parse_progress_pair("out_time_ms", "2500000"), ProgressLine::Position(2.5));
        assert_eq!(parse_progress_pair("out_time", "00:01:30.500000"), ProgressLine::Position(90.5));
        assert_eq!(parse_progress_pair("fps", "23.97"), ProgressLine::Fps(23.97));
        assert_eq!(
            parse_progress_pair("progress", "end"),
            ProgressLine::BlockEnd { finished: true }
        );
        assert_eq!(parse_progress_pair("total_size", "262192"), ProgressLine::OutputSize(262192));
        assert_eq!(parse_progress_pair("total_size", "N/A"), ProgressLine::Ignored);
        assert_eq!(parse_progress_pair("bitrate", "1200kbits/s"), ProgressLine::Ignored);
        assert_eq!(parse_progress_pair("out_time_us", "N/A"), ProgressLine::Ignored);
        assert_eq!(
            parse_progress_pair("out_time_us", "-9223372036854775807"),
            ProgressLine::Ignored
        );
        assert_eq!(parse_progress_pair("out_time", "-00:00:00.040000"), ProgressLine::Ignored);
    }

    #[test]
    fn test_split_key_value() {
        assert_eq!(split_key_value("fps=30.0\n"), Some(("fps", "30.0")));
        assert_eq!(split_key_value("[libx264 @ 0x55] frame I:1"), None);
        assert_eq!(split_key_value("Stream mapping: a=b"), None);
    }

    #[test]
    fn test_eta_and_ratio_thresholds() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(100.0, 1_000_000, start);

        tracker.observe(&ProgressSample {
            position_secs: Some(0.4),
            ..Default::default()
        });
        assert_eq!(tracker.eta_secs(start + Duration::from_secs(1)), None);
        assert_eq!(tracker.compression_ratio(10), None);

        tracker.observe(&ProgressSample {
            position_secs: Some(25.0),
            ..Default::default()
        });
        let eta = tracker.eta_secs(start + Duration::from_secs(10)).unwrap();
        assert!((eta - 30.0).abs() < 1e-9);
        let ratio = tracker.compression_ratio(125_000).unwrap();
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_defaults_to_one_second() {
        let mut tracker = ProgressTracker::new(0.0, 10, Instant::now());
        let p = tracker.observe(&ProgressSample {
            position_secs: Some(0.5),
            ..Default::default()
        });
        assert!((p - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_snapshots_are_throttled() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(10.0, 10, start);
        assert!(tracker.should_emit(start));
        assert!(!tracker.should_emit(start + Duration::from_millis(50)));
        assert!(tracker.should_emit(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_sample_block_end() {
        let mut sample = ProgressSample::default();
        assert!(!sample.apply(ProgressLine::Fps(12.0)));
        assert!(!sample.apply(ProgressLine::Position(3.0)));
        assert!(sample.apply(ProgressLine::BlockEnd { finished: false }));
        assert_eq!(sample.position_secs, Some(3.0));
        assert!(!sample.finished);
    }

    // **Property: the monotonic clamp never lets progress regress or leave [0, 1]**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_clamp_is_monotone(
            duration in 0.1f64..10_000.0,
            positions in proptest::collection::vec(-100.0f64..20_000.0, 1..80),
        ) {
            let mut tracker = ProgressTracker::new(duration, 1_000, Instant::now());
            let mut last = tracker.progress();
            for pos in positions {
                let now = tracker.observe(&ProgressSample {
                    position_secs: Some(pos),
                    ..Default::default()
                });
                prop_assert!(now >= last, "progress regressed from {} to {}", last, now);
                prop_assert!((0.0..=1.0).contains(&now));
                last = now;
            }
        }
    }
}

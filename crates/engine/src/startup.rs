//! Startup checks module for tiercast
//!
//! Preflight checks run before a batch starts:
//! - The encoder program runs (`<program> -version`)
//! - The staging directory can be created

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("staging directory unusable: {0}")]
    StagingDir(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 8.0 ..."
/// - N-prefixed: "ffmpeg version n8.0-... ..."
///
/// Git builds ("ffmpeg version N-112345-g...") carry no release number and
/// yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Check that `program -version` runs
///
/// Returns the parsed major version when the output looks like FFmpeg's.
pub fn check_encoder_available(program: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    Ok(parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout)))
}

/// Check that `dir` exists or can be created and is a directory
pub fn check_staging_dir(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        StartupError::StagingDir(format!("{}: {}", dir.display(), e))
    })?;
    if !dir.is_dir() {
        return Err(StartupError::StagingDir(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    Ok(())
}

/// Run all startup checks in order: encoder, then staging directory
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    match check_encoder_available(&cfg.encoder.program)? {
        Some(major) => info!(program = %cfg.encoder.program, major, "encoder found"),
        None => warn!(program = %cfg.encoder.program, "encoder found, version not recognised"),
    }
    check_staging_dir(&cfg.io.resolved_cache_root())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    // **Property: standard version strings parse to their major number**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            suffix in "[a-z0-9 ]{0,20}",
        ) {
            let output = format!("ffmpeg version {}.{} {}", major, minor, suffix);
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
        ) {
            let output = format!(
                "ffmpeg version n{}.{}-static Copyright (c) 2000-2025\nbuilt with gcc",
                major, minor
            );
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = "some banner\nffmpeg version 7.1 Copyright (c) 2000-2024\nconfiguration: --enable-gpl";
        assert_eq!(parse_ffmpeg_version(output), Some(7));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version(""), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112345-gdeadbeef"), None);
    }

    #[test]
    fn test_missing_encoder_is_reported() {
        let err = check_encoder_available("/nonexistent/tiercast-encoder").unwrap_err();
        assert!(matches!(err, StartupError::EncoderUnavailable(_)));
    }

    #[test]
    fn test_staging_dir_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        check_staging_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_staging_dir_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(check_staging_dir(&file).is_err());
    }
}

//! Promotion of finished encodes to their final location.
//!
//! The working file lives in the staging directory. Promotion renames it
//! next to the source so a partially written "final" file is never visible.
//! When the rename crosses filesystems, the bytes are copied into a hidden
//! temporary file in the destination directory, which is then renamed.

use crate::config::EncoderConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Prefix of working files in the staging directory
pub const WORK_PREFIX: &str = "TEMP_ENC_";

/// Errors that can occur during promotion.
#[derive(Debug, Error)]
pub enum PromoteError {
    /// Source of the promotion does not exist or cannot be read.
    #[error("working file unavailable: {0}")]
    Source(io::Error),

    /// Failed to copy across filesystems.
    #[error("copy to destination directory failed: {0}")]
    CopyFailed(io::Error),

    /// Final rename failed.
    #[error("rename into place failed: {0}")]
    RenameFailed(io::Error),
}

/// Working output path: `<work_dir>/TEMP_ENC_<run-id>_<uuid>.<ext>`
pub fn working_output_path(work_dir: &Path, run_id: &str, extension: &str) -> PathBuf {
    work_dir.join(format!(
        "{}{}_{}.{}",
        WORK_PREFIX,
        run_id,
        Uuid::new_v4().simple(),
        extension
    ))
}

/// Final output path: `<source dir>/<stem><suffix>.<ext>`
///
/// # Example
///
/// ```
/// use std::path::{Path, PathBuf};
/// use tiercast::config::EncoderConfig;
/// use tiercast::promote::final_output_path;
///
/// let out = final_output_path(Path::new("/media/film.mkv"), &EncoderConfig::default());
/// assert_eq!(out, PathBuf::from("/media/film_encoded.mp4"));
/// ```
pub fn final_output_path(source: &Path, config: &EncoderConfig) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = format!("{}{}.{}", stem, config.output_suffix, config.output_extension);
    match source.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Move `work` to `dest` in one visible step.
///
/// Tries a rename first (same filesystem). Otherwise copies into a hidden
/// sibling of `dest` and renames that, removing `work` afterwards. On
/// failure `work` is left untouched and no partial `dest` exists.
pub fn promote(work: &Path, dest: &Path) -> Result<(), PromoteError> {
    fs::metadata(work).map_err(PromoteError::Source)?;

    if fs::rename(work, dest).is_ok() {
        return Ok(());
    }

    let staging = hidden_sibling(dest);
    if let Err(e) = fs::copy(work, &staging) {
        let _ = fs::remove_file(&staging);
        return Err(PromoteError::CopyFailed(e));
    }
    if let Err(e) = fs::rename(&staging, dest) {
        let _ = fs::remove_file(&staging);
        return Err(PromoteError::RenameFailed(e));
    }
    let _ = fs::remove_file(work);
    Ok(())
}

/// `.<name>.<uuid>.part` in the same directory as `dest`
fn hidden_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hidden = format!(".{}.{}.part", name, Uuid::new_v4().simple());
    match dest.parent() {
        Some(dir) => dir.join(hidden),
        None => PathBuf::from(hidden),
    }
}

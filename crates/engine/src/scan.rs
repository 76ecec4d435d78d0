//! Input discovery for batch runs.
//!
//! Expands the paths given on the command line into the list of video files
//! to admit: directories are walked recursively, files are taken as given.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Video file extensions accepted from directory walks (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".mov", ".avi", ".flv", ".m4v", ".ts", ".m2ts",
];

/// A video file found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Working files and staged copies left by this tool are never inputs.
fn is_own_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(crate::acquire::STAGED_PREFIX) || n.starts_with(crate::promote::WORK_PREFIX))
        .unwrap_or(false)
}

/// Expands `inputs` into video files.
///
/// - Directories are walked recursively, skipping hidden directories
/// - Files named explicitly are kept if they have a video extension
/// - Duplicates (after canonicalization) are dropped, first occurrence wins
/// - With `sort_by_size`, the result is ordered by ascending size
pub fn discover_inputs(inputs: &[PathBuf], sort_by_size: bool) -> Vec<InputFile> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    let mut push = |path: &Path, size_bytes: u64| {
        if !is_video_file(path) || is_own_artifact(path) {
            return;
        }
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if seen.insert(key) {
            found.push(InputFile {
                path: path.to_path_buf(),
                size_bytes,
            });
        }
    };

    for input in inputs {
        if input.is_file() {
            if let Ok(meta) = input.metadata() {
                push(input, meta.len());
            }
            continue;
        }

        let walker = WalkDir::new(input).into_iter().filter_entry(|entry| {
            // Skip hidden directories, but allow a hidden root
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') {
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                push(entry.path(), meta.len());
            }
        }
    }

    if sort_by_size {
        // Stable: equal sizes keep discovery order
        found.sort_by_key(|f| f.size_bytes);
    }
    found
}

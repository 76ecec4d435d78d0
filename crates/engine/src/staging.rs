//! Staging directory ownership
//!
//! Runs sharing a cache root share one staging directory. Each run drops a
//! marker `.run-<run-id>.pid` holding its process id and puts its run id in
//! every file it creates there (`CACHE_<run-id>_...`, `TEMP_ENC_<run-id>_...`).
//! Startup cleanup only removes files whose run is gone: no marker, or a
//! marker naming a process that is no longer alive.

use crate::acquire::STAGED_PREFIX;
use crate::promote::WORK_PREFIX;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MARKER_PREFIX: &str = ".run-";
const MARKER_SUFFIX: &str = ".pid";

/// Marker claiming the staging directory for one live run
///
/// Removed on drop.
#[derive(Debug)]
pub struct RunMarker {
    path: PathBuf,
}

impl RunMarker {
    /// Create `.run-<run_id>.pid` in `dir`; fails if it already exists
    pub fn create(dir: &Path, run_id: &str) -> io::Result<Self> {
        let path = dir.join(format!("{}{}{}", MARKER_PREFIX, run_id, MARKER_SUFFIX));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove run marker");
            }
        }
    }
}

/// Run id embedded in a staged or working file name
fn owner_run(name: &str) -> Option<&str> {
    let rest = name
        .strip_prefix(STAGED_PREFIX)
        .or_else(|| name.strip_prefix(WORK_PREFIX))?;
    rest.split_once('_').map(|(run, _)| run)
}

fn marker_run(name: &str) -> Option<&str> {
    name.strip_prefix(MARKER_PREFIX)?.strip_suffix(MARKER_SUFFIX)
}

fn process_alive(pid: u32, system: &mut Option<System>) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let system = system.get_or_insert_with(|| {
        System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
    });
    system.process(Pid::from_u32(pid)).is_some()
}

/// Remove staged copies and working files of runs that are no longer alive
///
/// Markers of dead runs are removed too. Returns the number of data files
/// removed. Best effort: unreadable entries are skipped.
pub fn clean_orphans(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let files: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| Some((e.file_name().into_string().ok()?, e.path())))
        .collect();

    let mut system = None;
    let mut live: HashMap<String, bool> = HashMap::new();
    for (name, path) in &files {
        let Some(run) = marker_run(name) else { continue };
        let alive = fs::read_to_string(path)
            .ok()
            .and_then(|pid| pid.trim().parse::<u32>().ok())
            .map(|pid| process_alive(pid, &mut system))
            .unwrap_or(false);
        if !alive {
            debug!(run, "removing marker of a finished run");
            let _ = fs::remove_file(path);
        }
        live.insert(run.to_string(), alive);
    }

    files
        .iter()
        .filter(|(name, _)| name.starts_with(STAGED_PREFIX) || name.starts_with(WORK_PREFIX))
        .filter(|(name, _)| {
            !owner_run(name)
                .and_then(|run| live.get(run).copied())
                .unwrap_or(false)
        })
        .filter(|(_, path)| fs::remove_file(path).is_ok())
        .count()
}

/// Deletes files on the blocking pool in submission order
///
/// Keeps file removal off the coordinator task.
pub struct FileReaper {
    tx: mpsc::UnboundedSender<PathBuf>,
    task: JoinHandle<usize>,
}

impl FileReaper {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let task = tokio::spawn(async move {
            let mut removed = 0;
            while let Some(path) = rx.recv().await {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to delete staged file"),
                }
            }
            removed
        });
        Self { tx, task }
    }

    pub fn remove(&self, path: PathBuf) {
        let _ = self.tx.send(path);
    }

    /// Wait until every submitted path is handled; returns files removed
    pub async fn finish(self) -> usize {
        drop(self.tx);
        self.task.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_owner_run() {
        assert_eq!(owner_run("CACHE_1a2b3c4d_9f8e7d6c_movie.mkv"), Some("1a2b3c4d"));
        assert_eq!(owner_run("TEMP_ENC_1a2b3c4d_0123abcd.mp4"), Some("1a2b3c4d"));
        assert_eq!(owner_run("TEMP_ENC_1.mp4"), None);
        assert_eq!(owner_run("movie.mkv"), None);
        assert_eq!(marker_run(".run-1a2b3c4d.pid"), Some("1a2b3c4d"));
    }

    #[test]
    fn test_clean_orphans_only_removes_own_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("CACHE_abc_123_movie.mkv"), b"x").unwrap();
        fs::write(dir.path().join("TEMP_ENC_1.mp4"), b"x").unwrap();
        fs::write(dir.path().join("keep.mkv"), b"x").unwrap();

        assert_eq!(clean_orphans(dir.path()), 2);
        assert!(dir.path().join("keep.mkv").exists());
        assert_eq!(clean_orphans(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_clean_orphans_spares_live_runs() {
        let dir = TempDir::new().unwrap();
        let marker = RunMarker::create(dir.path(), "live0001").unwrap();
        let staged = dir.path().join("CACHE_live0001_9f8e7d6c_movie.mkv");
        let work = dir.path().join("TEMP_ENC_live0001_0123abcd.mp4");
        fs::write(&staged, b"x").unwrap();
        fs::write(&work, b"x").unwrap();

        assert_eq!(clean_orphans(dir.path()), 0);
        assert!(staged.exists() && work.exists());
        assert!(marker.path().exists());

        drop(marker);
        assert_eq!(clean_orphans(dir.path()), 2);
    }

    #[test]
    fn test_clean_orphans_removes_dead_run_and_its_marker() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join(".run-dead0001.pid");
        fs::write(&marker, u32::MAX.to_string()).unwrap();
        fs::write(dir.path().join(".run-junk0001.pid"), b"not a pid").unwrap();
        fs::write(dir.path().join("CACHE_dead0001_9f8e7d6c_movie.mkv"), b"x").unwrap();

        assert_eq!(clean_orphans(dir.path()), 1);
        assert!(!marker.exists());
        assert!(!dir.path().join(".run-junk0001.pid").exists());
    }

    #[test]
    fn test_marker_is_exclusive_and_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let marker = RunMarker::create(dir.path(), "abcd0001").unwrap();
        assert_eq!(
            fs::read_to_string(marker.path()).unwrap(),
            std::process::id().to_string()
        );
        let err = RunMarker::create(dir.path(), "abcd0001").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let path = marker.path().to_path_buf();
        drop(marker);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reaper_removes_files_before_finish_returns() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("CACHE_a");
        let b = dir.path().join("CACHE_b");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"x").unwrap();

        let reaper = FileReaper::spawn();
        reaper.remove(a.clone());
        reaper.remove(b.clone());
        reaper.remove(dir.path().join("CACHE_missing"));
        assert_eq!(reaper.finish().await, 2);
        assert!(!a.exists() && !b.exists());
    }
}

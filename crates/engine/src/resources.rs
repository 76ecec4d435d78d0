//! Resource monitor for tiercast
//!
//! Reports free RAM and classifies storage as low-latency (solid state) or
//! seek-sensitive. The scheduler only consumes the [`ResourceMonitor`] trait.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sysinfo::{DiskKind, Disks, System};
use tracing::debug;

/// Free RAM reported when the platform gives nothing usable
pub const FALLBACK_FREE_RAM_GB: f64 = 4.0;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of resource information for scheduling decisions
pub trait ResourceMonitor: Send + Sync {
    /// Best-effort free RAM in GB
    fn free_ram_gb(&self) -> f64;

    /// Whether `path` lives on a low-seek-latency device
    fn is_low_latency_disk(&self, path: &Path) -> bool;
}

/// [`ResourceMonitor`] backed by sysinfo
///
/// Disk classification is cached per mount point, so each volume is probed
/// at most once per process.
pub struct SystemResources {
    system: Mutex<System>,
    mounts: Mutex<Option<Vec<(PathBuf, DiskKind)>>>,
    by_mount: Mutex<HashMap<PathBuf, bool>>,
}

impl SystemResources {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            mounts: Mutex::new(None),
            by_mount: Mutex::new(HashMap::new()),
        }
    }

    /// Mount point containing `path` and its disk kind
    fn mount_for(&self, path: &Path) -> Option<(PathBuf, DiskKind)> {
        let resolved = resolve_existing(path);
        let mut mounts = self.mounts.lock();
        let list = mounts.get_or_insert_with(|| {
            Disks::new_with_refreshed_list()
                .list()
                .iter()
                .map(|d| (d.mount_point().to_path_buf(), d.kind()))
                .collect()
        });
        longest_mount_prefix(list, &resolved)
    }
}

impl Default for SystemResources {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for SystemResources {
    fn free_ram_gb(&self) -> f64 {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        if sys.total_memory() == 0 {
            return FALLBACK_FREE_RAM_GB;
        }
        sys.available_memory() as f64 / GIB
    }

    fn is_low_latency_disk(&self, path: &Path) -> bool {
        let Some((mount, kind)) = self.mount_for(path) else {
            return false;
        };
        let mut cache = self.by_mount.lock();
        *cache.entry(mount.clone()).or_insert_with(|| {
            let low_latency = kind == DiskKind::SSD;
            debug!(mount = %mount.display(), ?kind, low_latency, "classified volume");
            low_latency
        })
    }
}

/// Canonical form of `path`, or of its nearest existing ancestor
fn resolve_existing(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Ok(canonical) = p.canonicalize() {
            return canonical;
        }
        current = p.parent();
    }
    path.to_path_buf()
}

fn longest_mount_prefix(mounts: &[(PathBuf, DiskKind)], path: &Path) -> Option<(PathBuf, DiskKind)> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .cloned()
}

/// Fixed [`ResourceMonitor`] for tests and `--assume-*` overrides
#[derive(Debug)]
pub struct StaticResources {
    free_ram_gb: Mutex<f64>,
    default_low_latency: bool,
    low_latency_roots: Vec<PathBuf>,
    seek_sensitive_roots: Vec<PathBuf>,
}

impl StaticResources {
    pub fn new(free_ram_gb: f64, default_low_latency: bool) -> Self {
        Self {
            free_ram_gb: Mutex::new(free_ram_gb),
            default_low_latency,
            low_latency_roots: Vec::new(),
            seek_sensitive_roots: Vec::new(),
        }
    }

    /// Treat everything under `root` as low-latency
    pub fn with_low_latency_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.low_latency_roots.push(root.into());
        self
    }

    /// Treat everything under `root` as seek-sensitive
    pub fn with_seek_sensitive_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.seek_sensitive_roots.push(root.into());
        self
    }

    pub fn set_free_ram_gb(&self, gb: f64) {
        *self.free_ram_gb.lock() = gb;
    }
}

impl ResourceMonitor for StaticResources {
    fn free_ram_gb(&self) -> f64 {
        *self.free_ram_gb.lock()
    }

    fn is_low_latency_disk(&self, path: &Path) -> bool {
        // Longest matching root wins
        let fast = self
            .low_latency_roots
            .iter()
            .filter(|r| path.starts_with(r))
            .map(|r| r.components().count())
            .max();
        let slow = self
            .seek_sensitive_roots
            .iter()
            .filter(|r| path.starts_with(r))
            .map(|r| r.components().count())
            .max();
        match (fast, slow) {
            (Some(f), Some(s)) => f > s,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.default_low_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resources_roots() {
        let res = StaticResources::new(16.0, false)
            .with_low_latency_root("/nvme")
            .with_seek_sensitive_root("/nvme/usb-hdd");

        assert!(res.is_low_latency_disk(Path::new("/nvme/video.mkv")));
        assert!(!res.is_low_latency_disk(Path::new("/nvme/usb-hdd/video.mkv")));
        assert!(!res.is_low_latency_disk(Path::new("/mnt/archive/video.mkv")));
        assert_eq!(res.free_ram_gb(), 16.0);

        res.set_free_ram_gb(2.5);
        assert_eq!(res.free_ram_gb(), 2.5);
    }

    #[test]
    fn test_longest_mount_prefix() {
        let mounts = vec![
            (PathBuf::from("/"), DiskKind::HDD),
            (PathBuf::from("/mnt/fast"), DiskKind::SSD),
        ];
        let (mount, kind) = longest_mount_prefix(&mounts, Path::new("/mnt/fast/a/b.mkv")).unwrap();
        assert_eq!(mount, PathBuf::from("/mnt/fast"));
        assert_eq!(kind, DiskKind::SSD);

        let (mount, _) = longest_mount_prefix(&mounts, Path::new("/home/x.mkv")).unwrap();
        assert_eq!(mount, PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_existing_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("not/yet/created.mkv");
        let resolved = resolve_existing(&missing);
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_system_resources_reports_positive_ram() {
        let res = SystemResources::new();
        assert!(res.free_ram_gb() > 0.0);
        // Same volume probed twice must agree
        let tmp = std::env::temp_dir();
        assert_eq!(res.is_low_latency_disk(&tmp), res.is_low_latency_disk(&tmp));
    }
}

//! Cache store for acquired job inputs
//!
//! Owns RAM buffers (addressed by an unguessable token for the loopback
//! server) and the paths of staged copies. One lock guards both maps.

use crate::job::JobId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Entry {
    Ram { token: String, data: Bytes },
    Staged { path: PathBuf },
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    tokens: HashMap<String, JobId>,
    ram_bytes: u64,
}

impl Inner {
    /// Detach a job's entry; returns the staged path to delete, if any
    fn detach(&mut self, job: JobId) -> Option<Option<PathBuf>> {
        match self.entries.remove(&job)? {
            Entry::Ram { token, data } => {
                self.tokens.remove(&token);
                self.ram_bytes = self.ram_bytes.saturating_sub(data.len() as u64);
                Some(None)
            }
            Entry::Staged { path } => Some(Some(path)),
        }
    }
}

/// Token-addressed registry of RAM buffers and staged files
#[derive(Debug, Default)]
pub struct CacheStore {
    inner: Mutex<Inner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a RAM buffer for `job` and return the token that addresses it
    ///
    /// Any earlier entry for the same job is released first.
    pub fn put_bytes(&self, job: JobId, data: Bytes) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let stale = {
            let mut inner = self.inner.lock();
            let stale = inner.detach(job).flatten();
            inner.ram_bytes += data.len() as u64;
            inner.tokens.insert(token.clone(), job);
            inner.entries.insert(
                job,
                Entry::Ram {
                    token: token.clone(),
                    data,
                },
            );
            stale
        };
        if let Some(path) = stale {
            remove_staged(&path);
        }
        token
    }

    /// Buffer behind `token`; cloning `Bytes` shares the allocation
    pub fn get(&self, token: &str) -> Option<Bytes> {
        let inner = self.inner.lock();
        let job = inner.tokens.get(token)?;
        match inner.entries.get(job)? {
            Entry::Ram { data, .. } => Some(data.clone()),
            Entry::Staged { .. } => None,
        }
    }

    /// Record the staged copy for `job`
    pub fn put_staged_file(&self, job: JobId, path: PathBuf) {
        let stale = {
            let mut inner = self.inner.lock();
            let stale = inner.detach(job).flatten();
            inner.entries.insert(job, Entry::Staged { path: path.clone() });
            stale
        };
        if let Some(old) = stale.filter(|old| *old != path) {
            remove_staged(&old);
        }
    }

    pub fn staged_path(&self, job: JobId) -> Option<PathBuf> {
        match self.inner.lock().entries.get(&job)? {
            Entry::Staged { path } => Some(path.clone()),
            Entry::Ram { .. } => None,
        }
    }

    /// Drop whatever is held for `job`, deleting a staged file
    ///
    /// Safe to call any number of times; returns whether anything was held.
    /// After this returns, `get` on the job's token yields `None`.
    pub fn release(&self, job: JobId) -> bool {
        match self.detach(job) {
            Some(staged) => {
                if let Some(path) = staged {
                    remove_staged(&path);
                }
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `job` without touching the disk
    ///
    /// RAM is freed and the token invalidated at once. Returns `None` when
    /// nothing was held, otherwise the staged file the caller must delete.
    pub fn detach(&self, job: JobId) -> Option<Option<PathBuf>> {
        let detached = self.inner.lock().detach(job);
        if detached.is_some() {
            debug!(job = %job, "released cache entry");
        }
        detached
    }

    /// Release every entry
    pub fn release_all(&self) {
        for path in self.detach_all() {
            remove_staged(&path);
        }
    }

    /// Drop every entry; returns the staged files the caller must delete
    pub fn detach_all(&self) -> Vec<PathBuf> {
        let mut inner = self.inner.lock();
        inner.tokens.clear();
        inner.ram_bytes = 0;
        inner
            .entries
            .drain()
            .filter_map(|(_, entry)| match entry {
                Entry::Staged { path } => Some(path),
                Entry::Ram { .. } => None,
            })
            .collect()
    }

    /// Bytes currently held in RAM buffers
    pub fn ram_bytes(&self) -> u64 {
        self.inner.lock().ram_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

fn remove_staged(path: &PathBuf) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete staged file"),
    }
}

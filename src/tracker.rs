//! Set of files currently being written, keyed by path
//!
//! Filesystem callbacks call [`ActivityTracker::observe`] from the watcher thread
//! while the poll timer reads [`ActivityTracker::snapshot`]. Every operation takes
//! the single lock briefly; iteration always happens over a copied snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub last_observed_mtime: SystemTime,
    pub first_observed: SystemTime,
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    files: Mutex<HashMap<PathBuf, WatchedFile>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a create/modify observation. Returns true when the path is new.
    pub fn observe(&self, path: &Path, mtime: SystemTime) -> bool {
        let mut files = self.files.lock();
        match files.get_mut(path) {
            Some(entry) => {
                entry.last_observed_mtime = mtime;
                false
            }
            None => {
                files.insert(
                    path.to_path_buf(),
                    WatchedFile {
                        path: path.to_path_buf(),
                        last_observed_mtime: mtime,
                        first_observed: SystemTime::now(),
                    },
                );
                true
            }
        }
    }

    /// Copy of the current entries, sorted by path
    pub fn snapshot(&self) -> Vec<WatchedFile> {
        let mut out: Vec<WatchedFile> = self.files.lock().values().cloned().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    pub fn remove(&self, path: &Path) -> Option<WatchedFile> {
        self.files.lock().remove(path)
    }

    /// Remove `path` only if it was not modified since `expected_mtime` was read.
    ///
    /// This is the single ownership hand-off: at most one caller ever gets `Some`.
    pub fn claim(&self, path: &Path, expected_mtime: SystemTime) -> Option<WatchedFile> {
        let mut files = self.files.lock();
        match files.get(path) {
            Some(entry) if entry.last_observed_mtime == expected_mtime => files.remove(path),
            _ => None,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

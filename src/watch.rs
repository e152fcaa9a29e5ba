//! Filesystem notifications into the activity tracker
//!
//! The notify callback runs on the watcher's own thread and only touches the
//! tracker, whose lock is the single synchronisation point with the poll timer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::detect::{is_candidate, list_candidates};
use crate::tracker::ActivityTracker;

/// Keeps the underlying watcher alive; dropping it stops notifications
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl FsWatcher {
    /// Watch `dir` (non-recursively) and seed the tracker with files already present
    pub fn start(dir: &Path, extensions: Vec<String>, tracker: Arc<ActivityTracker>) -> Result<Self> {
        let cb_tracker = tracker.clone();
        let cb_exts = extensions.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => apply_event(&cb_tracker, &event, &cb_exts),
            Err(e) => warn!(error = %e, "watch error"),
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let seeded = seed(&tracker, dir, &extensions)
            .with_context(|| format!("failed to scan {}", dir.display()))?;
        debug!(dir = %dir.display(), seeded, "watching");

        Ok(Self {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Track files that existed before the watcher started. Returns how many.
pub fn seed(tracker: &ActivityTracker, dir: &Path, extensions: &[String]) -> io::Result<usize> {
    let mut n = 0;
    for path in list_candidates(dir, extensions)? {
        if let Ok(mtime) = fs::metadata(&path).and_then(|md| md.modified()) {
            tracker.observe(&path, mtime);
            n += 1;
        }
    }
    Ok(n)
}

/// Apply one notify event to the tracker
pub fn apply_event(tracker: &ActivityTracker, event: &Event, extensions: &[String]) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in event.paths.iter().filter(|p| is_candidate(p, extensions)) {
                refresh(tracker, path);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if tracker.remove(path).is_some() {
                    debug!(path = %path.display(), "stopped watching removed file");
                }
            }
        }
        _ => {}
    }
}

// Renames surface as Modify on both names; stat decides which side we are on
fn refresh(tracker: &ActivityTracker, path: &Path) {
    match fs::metadata(path) {
        Ok(md) if md.is_file() => match md.modified() {
            Ok(mtime) => {
                if tracker.observe(path, mtime) {
                    debug!(path = %path.display(), "new recording");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "no mtime available"),
        },
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracker.remove(path);
        }
        Err(e) => warn!(path = %path.display(), error = %e, "cannot stat file"),
    }
}

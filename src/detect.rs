//! Deciding when a growing recording is finished
//!
//! There is no close notification for a file another process is writing, so
//! completion is inferred. Two interchangeable strategies share one contract:
//! never return a file that might still be appended to.
//!
//! - [`IdleDetector`]: the file's mtime has not moved for `idle_threshold`.
//! - [`NewestExclusionDetector`]: every file except the one with the newest
//!   timestamp encoded in its name (that one is presumed still open).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::DetectError;
use crate::tracker::ActivityTracker;

/// Default filename timestamp layout, e.g. `2024-01-01_10-05-00.avi`
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

pub trait CompletionDetector: Send {
    /// Files that are complete as of `now`. Returned files are owned by the caller.
    fn poll(&mut self, now: SystemTime) -> Result<Vec<PathBuf>, DetectError>;

    fn name(&self) -> &'static str;
}

/// Does `path` look like a recording we should pick up?
pub fn is_candidate(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.ends_with(".part") {
        return false;
    }
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

/// Regular candidate files directly inside `dir`
pub fn list_candidates(dir: &Path, extensions: &[String]) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_file = entry.file_type().map(|ft| ft.is_file()).unwrap_or(false);
        let path = entry.path();
        if is_file && is_candidate(&path, extensions) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Idle-mtime polling over the tracker's watch set
pub struct IdleDetector {
    tracker: Arc<ActivityTracker>,
    idle_threshold: Duration,
}

impl IdleDetector {
    pub fn new(tracker: Arc<ActivityTracker>, idle_threshold: Duration) -> Self {
        Self {
            tracker,
            idle_threshold,
        }
    }
}

impl CompletionDetector for IdleDetector {
    fn poll(&mut self, now: SystemTime) -> Result<Vec<PathBuf>, DetectError> {
        let mut ready = Vec::new();
        for watched in self.tracker.snapshot() {
            let mtime = match fs::metadata(&watched.path).and_then(|md| md.modified()) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %watched.path.display(), "watched file vanished");
                    self.tracker.remove(&watched.path);
                    continue;
                }
                Err(e) => {
                    warn!(path = %watched.path.display(), error = %e, "cannot stat watched file");
                    continue;
                }
            };

            // A write we never got an event for restarts the window
            if mtime != watched.last_observed_mtime {
                self.tracker.observe(&watched.path, mtime);
                continue;
            }

            // mtime in the future counts as just written
            let idle_for = now.duration_since(mtime).unwrap_or(Duration::ZERO);
            if idle_for < self.idle_threshold {
                continue;
            }

            if self.tracker.claim(&watched.path, mtime).is_some() {
                debug!(path = %watched.path.display(), idle_secs = idle_for.as_secs(), "file is stable");
                ready.push(watched.path);
            }
        }
        Ok(ready)
    }

    fn name(&self) -> &'static str {
        "idle"
    }
}

/// Everything but the newest timestamped file in a directory
pub struct NewestExclusionDetector {
    dir: PathBuf,
    extensions: Vec<String>,
    format: String,
}

impl NewestExclusionDetector {
    pub fn new(dir: PathBuf, extensions: Vec<String>, format: impl Into<String>) -> Self {
        Self {
            dir,
            extensions,
            format: format.into(),
        }
    }

    fn timestamp_of(&self, path: &Path) -> Result<NaiveDateTime, DetectError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        NaiveDateTime::parse_from_str(&stem, &self.format).map_err(|_| {
            DetectError::UnparsableTimestamp {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                format: self.format.clone(),
            }
        })
    }

    /// Split `files` into (complete sorted by name, the excluded newest)
    pub fn partition(
        &self,
        files: Vec<PathBuf>,
    ) -> Result<(Vec<PathBuf>, Option<PathBuf>), DetectError> {
        let mut stamped = Vec::with_capacity(files.len());
        for path in files {
            let ts = self.timestamp_of(&path)?;
            stamped.push((ts, path));
        }
        // Ties on timestamp go to the greater name
        let newest = stamped
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(i, _)| i);
        let excluded = newest.map(|i| stamped.swap_remove(i).1);
        let mut complete: Vec<PathBuf> = stamped.into_iter().map(|(_, p)| p).collect();
        complete.sort();
        Ok((complete, excluded))
    }
}

impl CompletionDetector for NewestExclusionDetector {
    fn poll(&mut self, _now: SystemTime) -> Result<Vec<PathBuf>, DetectError> {
        let files =
            list_candidates(&self.dir, &self.extensions).map_err(|source| DetectError::ListDir {
                dir: self.dir.clone(),
                source,
            })?;
        let (complete, excluded) = self.partition(files)?;
        if let Some(newest) = excluded {
            debug!(path = %newest.display(), "newest recording held back");
        }
        Ok(complete)
    }

    fn name(&self) -> &'static str {
        "newest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        vec!["avi".to_string()]
    }

    /// Create a file whose mtime is `base + at` seconds
    fn write_at(path: &Path, base: SystemTime, at: u64) -> SystemTime {
        let mut f = File::options().create(true).append(true).open(path).unwrap();
        f.write_all(b"frame").unwrap();
        drop(f);
        let mtime = base + Duration::from_secs(at);
        set_file_mtime(path, FileTime::from_system_time(mtime)).unwrap();
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    /// Whole seconds, well in the past
    fn base() -> SystemTime {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        SystemTime::UNIX_EPOCH + Duration::from_secs(now - 10_000)
    }

    fn secs(base: SystemTime, s: u64) -> SystemTime {
        base + Duration::from_secs(s)
    }

    #[test]
    fn test_idle_promotes_at_first_poll_after_threshold() {
        // idle=10s, polls every 5s, last write at t=3 -> promoted at t=15
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        let mtime = write_at(&path, base, 3);
        tracker.observe(&path, mtime);

        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(10));
        assert!(detector.poll(secs(base, 5)).unwrap().is_empty());
        assert!(detector.poll(secs(base, 10)).unwrap().is_empty());
        assert_eq!(detector.poll(secs(base, 15)).unwrap(), vec![path.clone()]);
        assert!(!tracker.contains(&path));
        // Claimed files are never examined again
        assert!(detector.poll(secs(base, 20)).unwrap().is_empty());
    }

    #[test]
    fn test_idle_never_promotes_before_threshold() {
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.observe(&path, write_at(&path, base, 0));
        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(10));
        for t in 0..10 {
            assert!(detector.poll(secs(base, t)).unwrap().is_empty(), "t={t}");
        }
        assert_eq!(detector.poll(secs(base, 10)).unwrap().len(), 1);
    }

    #[test]
    fn test_modification_resets_window() {
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.observe(&path, write_at(&path, base, 3));
        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(10));

        assert!(detector.poll(secs(base, 10)).unwrap().is_empty());
        tracker.observe(&path, write_at(&path, base, 12));
        assert!(detector.poll(secs(base, 15)).unwrap().is_empty());
        assert!(detector.poll(secs(base, 20)).unwrap().is_empty());
        assert_eq!(detector.poll(secs(base, 25)).unwrap(), vec![path]);
    }

    #[test]
    fn test_missed_event_detected_by_poll() {
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.observe(&path, write_at(&path, base, 3));
        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(10));

        // Written at t=12 but no event was delivered
        let rewritten = write_at(&path, base, 12);
        assert!(detector.poll(secs(base, 15)).unwrap().is_empty());
        assert_eq!(tracker.snapshot()[0].last_observed_mtime, rewritten);
        assert!(detector.poll(secs(base, 20)).unwrap().is_empty());
        assert_eq!(detector.poll(secs(base, 25)).unwrap().len(), 1);
    }

    #[test]
    fn test_vanished_file_is_dropped() {
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.observe(&path, write_at(&path, base, 0));
        std::fs::remove_file(&path).unwrap();

        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(1));
        assert!(detector.poll(secs(base, 100)).unwrap().is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_future_mtime_is_not_stable() {
        let dir = TempDir::new().unwrap();
        let base = base();
        let path = dir.path().join("clip.avi");
        let tracker = Arc::new(ActivityTracker::new());
        tracker.observe(&path, write_at(&path, base, 500));
        let mut detector = IdleDetector::new(Arc::clone(&tracker), Duration::from_secs(10));
        assert!(detector.poll(secs(base, 100)).unwrap().is_empty());
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        File::create(&p).unwrap();
        p
    }

    #[test]
    fn test_newest_exclusion_scenario() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "2024-01-01_10-00-00.avi");
        let b = touch(dir.path(), "2024-01-01_10-05-00.avi");
        touch(dir.path(), "2024-01-01_10-09-00.avi");

        let mut detector = NewestExclusionDetector::new(
            dir.path().to_path_buf(),
            exts(),
            DEFAULT_TIMESTAMP_FORMAT,
        );
        assert_eq!(detector.poll(SystemTime::now()).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_newest_by_timestamp_not_by_name_order() {
        let detector = NewestExclusionDetector::new(PathBuf::new(), exts(), "%d-%m-%Y_%H-%M-%S");
        // Lexically last, chronologically first
        let files = vec![
            PathBuf::from("/r/31-12-2023_23-00-00.avi"),
            PathBuf::from("/r/01-01-2024_09-00-00.avi"),
            PathBuf::from("/r/02-01-2024_08-00-00.avi"),
        ];
        let (complete, excluded) = detector.partition(files).unwrap();
        assert_eq!(excluded, Some(PathBuf::from("/r/02-01-2024_08-00-00.avi")));
        assert_eq!(
            complete,
            vec![
                PathBuf::from("/r/01-01-2024_09-00-00.avi"),
                PathBuf::from("/r/31-12-2023_23-00-00.avi"),
            ]
        );
    }

    #[test]
    fn test_single_file_is_held_back() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "2024-01-01_10-00-00.avi");
        let mut detector = NewestExclusionDetector::new(
            dir.path().to_path_buf(),
            exts(),
            DEFAULT_TIMESTAMP_FORMAT,
        );
        assert!(detector.poll(SystemTime::now()).unwrap().is_empty());
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let mut detector = NewestExclusionDetector::new(
            dir.path().to_path_buf(),
            exts(),
            DEFAULT_TIMESTAMP_FORMAT,
        );
        assert!(detector.poll(SystemTime::now()).unwrap().is_empty());
    }

    #[test]
    fn test_unparsable_name_fails_poll() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "2024-01-01_10-00-00.avi");
        touch(dir.path(), "holiday.avi");
        let mut detector = NewestExclusionDetector::new(
            dir.path().to_path_buf(),
            exts(),
            DEFAULT_TIMESTAMP_FORMAT,
        );
        match detector.poll(SystemTime::now()) {
            Err(DetectError::UnparsableTimestamp { name, .. }) => assert_eq!(name, "holiday.avi"),
            other => panic!("expected parse failure, got {other:?}"),
        }
    }

    #[test]
    fn test_non_candidates_ignored() {
        let dir = TempDir::new().unwrap();
        let a = touch(dir.path(), "2024-01-01_10-00-00.avi");
        touch(dir.path(), "2024-01-01_10-01-00.avi");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), ".2024-01-01_09-00-00.avi");
        std::fs::create_dir(dir.path().join("pending")).unwrap();
        let mut detector = NewestExclusionDetector::new(
            dir.path().to_path_buf(),
            exts(),
            DEFAULT_TIMESTAMP_FORMAT,
        );
        assert_eq!(detector.poll(SystemTime::now()).unwrap(), vec![a]);
    }

    #[test]
    fn test_is_candidate() {
        let e = exts();
        assert!(is_candidate(Path::new("/r/a.avi"), &e));
        assert!(is_candidate(Path::new("/r/a.AVI"), &e));
        assert!(!is_candidate(Path::new("/r/a.mp4"), &e));
        assert!(!is_candidate(Path::new("/r/.a.avi"), &e));
        assert!(!is_candidate(Path::new("/r/a.avi.part"), &e));
        assert!(is_candidate(Path::new("/r/a.mp4"), &[]));
    }
}

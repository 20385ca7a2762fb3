//! Modification sources polled by the pool to detect stale transformers.
//!
//! - [`ManualSource`]: in-memory timestamp bumped by whoever owns the themes
//! - [`DirectorySource`]: newest file mtime below a theme directory

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Anything that can report when the theme material was last changed.
///
/// Only the ordering of successive values matters. `None` means the source
/// has no timestamp (yet) and never triggers a flush.
///
/// Polled at most once per staleness interval, outside the pool's state lock
/// but inline on the acquiring task, so a slow read delays that one acquire.
pub trait ModificationSource: Send + Sync + 'static {
    fn modified(&self) -> Option<SystemTime>;
}

/// Settable modification time.
#[derive(Debug, Default)]
pub struct ManualSource {
    modified: Mutex<Option<SystemTime>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(time: SystemTime) -> Self {
        Self {
            modified: Mutex::new(Some(time)),
        }
    }

    pub fn set(&self, time: SystemTime) {
        *self.lock() = Some(time);
    }

    /// Mark the source as modified now. Always moves the timestamp forward,
    /// even if the wall clock has not ticked since the last call.
    pub fn touch(&self) -> SystemTime {
        let mut modified = self.lock();
        let now = SystemTime::now();
        let next = match *modified {
            Some(prev) if prev >= now => prev + Duration::from_millis(1),
            _ => now,
        };
        *modified = Some(next);
        next
    }

    pub fn advance(&self, by: Duration) -> SystemTime {
        let mut modified = self.lock();
        let next = modified.unwrap_or(SystemTime::UNIX_EPOCH) + by;
        *modified = Some(next);
        next
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SystemTime>> {
        // A panic while holding this lock cannot leave a torn timestamp.
        self.modified.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ModificationSource for ManualSource {
    fn modified(&self) -> Option<SystemTime> {
        *self.lock()
    }
}

/// Reports the newest modification time of any file under `root`.
///
/// Every poll walks the whole tree with blocking filesystem calls.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModificationSource for DirectorySource {
    fn modified(&self) -> Option<SystemTime> {
        newest_mtime(&self.root)
    }
}

fn get_mtime(path: &Path) -> Option<SystemTime> {
    path.metadata().and_then(|m| m.modified()).ok()
}

/// Newest mtime of `path` and, for directories, everything below it.
/// Unreadable entries are skipped.
fn newest_mtime(path: &Path) -> Option<SystemTime> {
    let mut newest = get_mtime(path);

    let Ok(entries) = std::fs::read_dir(path) else {
        return newest;
    };

    for entry in entries.flatten() {
        let child = match entry.file_type() {
            Ok(ft) if ft.is_dir() => newest_mtime(&entry.path()),
            Ok(_) => get_mtime(&entry.path()),
            Err(_) => None,
        };
        newest = newest.max(child);
    }

    newest
}

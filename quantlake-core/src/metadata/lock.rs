//! Lock files for cross-process exclusion on metadata keys.
//!
//! A lock is a file created with `create_new`; whoever creates it owns the
//! key until the guard is dropped. Each holder writes a unique token into
//! the file. Locks older than `stale_after` are assumed to belong to a
//! crashed process and are broken by renaming them aside; if the renamed
//! file turns out to be a fresh lock created in the meantime, it is linked
//! back in place.

use super::MetadataError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Guard for an acquired lock file. Removes the file on drop if it still
/// holds this guard's token.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Block until the lock at `path` is acquired or `timeout` elapses.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MetadataError::io(parent, e))?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let token = holder_token();
                    let _ = write!(file, "{token}");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(observed) = stale_contents(path, stale_after) {
                        tracing::warn!(lock = %path.display(), holder = %observed.trim(), "breaking stale metadata lock");
                        break_stale(path, &observed, stale_after);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(MetadataError::LockTimeout {
                            path: path.to_path_buf(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(MetadataError::io(path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path).is_ok_and(|c| c.trim() == self.token);
        if ours {
            let _ = fs::remove_file(&self.path);
        } else {
            tracing::warn!(lock = %self.path.display(), "lock was taken over, leaving it in place");
        }
    }
}

/// `pid:epoch-nanos:counter`, unique across processes and threads.
fn holder_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let n = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    format!("{}:{nanos}:{n}", std::process::id())
}

/// Contents of the lock at `path` if it is older than `stale_after`.
fn stale_contents(path: &Path, stale_after: Duration) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    is_stale(path, stale_after).then_some(contents)
}

/// Move a stale lock aside. Only one contender's rename succeeds; the
/// winner checks that what it moved is still the lock it judged stale and
/// otherwise restores it with a no-clobber hard link.
fn break_stale(path: &Path, observed: &str, stale_after: Duration) {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parked = path.with_file_name(format!("{file_name}.{}.stale", holder_token()));
    if fs::rename(path, &parked).is_err() {
        return;
    }
    let moved = fs::read_to_string(&parked).unwrap_or_default();
    if moved != observed || !is_stale(&parked, stale_after) {
        tracing::debug!(lock = %path.display(), "moved a live lock, restoring it");
        let _ = fs::hard_link(&parked, path);
    }
    let _ = fs::remove_file(&parked);
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.lock");

        let guard = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_secs(60))
            .unwrap();
        let err = FileLock::acquire(&path, Duration::from_millis(20), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, MetadataError::LockTimeout { .. }));

        drop(guard);
        assert!(!path.exists());
        assert!(
            FileLock::acquire(&path, Duration::from_millis(20), Duration::from_secs(60)).is_ok()
        );
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.lock");
        fs::write(&path, "12345").unwrap();

        thread::sleep(Duration::from_millis(20));
        let guard =
            FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(1)).unwrap();
        assert_eq!(guard.path(), path.as_path());
        assert_ne!(fs::read_to_string(&path).unwrap(), "12345");
    }

    #[test]
    fn live_lock_moved_while_breaking_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.lock");
        // The crashed holder's lock was replaced by a new one after it was
        // judged stale.
        fs::write(&path, "999:0:0").unwrap();
        break_stale(&path, "12345", Duration::from_millis(1));

        assert_eq!(fs::read_to_string(&path).unwrap(), "999:0:0");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn drop_leaves_a_lock_it_no_longer_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.lock");
        let guard = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_secs(60))
            .unwrap();
        fs::write(&path, "999:0:0").unwrap();

        drop(guard);
        assert_eq!(fs::read_to_string(&path).unwrap(), "999:0:0");
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(holder_token(), holder_token());
    }
}

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// Write `contents` to `target` atomically: the bytes go to a temporary file
/// in the same directory which is then renamed over the target. Readers never
/// observe a partially written document. Parent directories are created.
pub fn atomic_write(target: &Path, contents: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("no parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let tmp_name = format!(
        "{}.{}.{}.tmp",
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id(),
        uuid::Uuid::new_v4()
    );
    let tmp_path = parent.join(tmp_name);

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, target)
            .with_context(|| format!("failed to rename into {}", target.display()))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Modification time of a file as a Unix timestamp in seconds; 0.0 when the
/// file does not exist.
pub fn file_mtime(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Returns the current mtime and whether the file advanced past
/// `previous_mtime`. Drives the registry index cache invalidation.
pub fn check_file_modified(path: &Path, previous_mtime: f64) -> (f64, bool) {
    let current = file_mtime(path);
    (current, current > previous_mtime)
}

/// Cross-process lock built on exclusive file creation. The lock file carries
/// the holder's PID and acquisition timestamp; a holder whose timestamp is
/// older than `stale_timeout` is considered dead and its lock is broken.
pub struct FileLock {
    lock_path: PathBuf,
    timeout: Duration,
    stale_timeout: Duration,
}

pub struct FileLockGuard {
    lock_path: PathBuf,
}

impl FileLock {
    pub fn new(lock_path: PathBuf) -> Self {
        Self {
            lock_path,
            timeout: Duration::from_secs(300),
            stale_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeouts(lock_path: PathBuf, timeout: Duration, stale_timeout: Duration) -> Self {
        Self {
            lock_path,
            timeout,
            stale_timeout,
        }
    }

    fn try_create(&self) -> bool {
        if let Some(parent) = self.lock_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                let _ = writeln!(file, "{}\n{}", std::process::id(), now);
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(err) => {
                warn!(path = %self.lock_path.display(), error = %err, "failed to create lock file");
                false
            }
        }
    }

    fn is_stale(&self) -> bool {
        let Ok(contents) = fs::read_to_string(&self.lock_path) else {
            // Unreadable or vanished: treat as corrupt and reclaimable.
            return self.lock_path.exists();
        };
        let timestamp = contents.lines().nth(1).and_then(|l| l.trim().parse::<f64>().ok());
        match timestamp {
            Some(ts) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                now - ts > self.stale_timeout.as_secs_f64()
            }
            None => {
                warn!(path = %self.lock_path.display(), "unparseable lock file, assuming stale");
                true
            }
        }
    }

    /// Blocks until the lock is acquired or the timeout elapses.
    pub fn acquire(&self) -> Result<FileLockGuard> {
        let start = Instant::now();
        loop {
            if self.try_create() {
                debug!(path = %self.lock_path.display(), "lock acquired");
                return Ok(FileLockGuard {
                    lock_path: self.lock_path.clone(),
                });
            }

            if self.is_stale() {
                warn!(path = %self.lock_path.display(), "breaking stale lock");
                let _ = fs::remove_file(&self.lock_path);
                continue;
            }

            if start.elapsed() > self.timeout {
                bail!(
                    "failed to acquire lock {} within {:?}",
                    self.lock_path.display(),
                    self.timeout
                );
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %err, "failed to release lock");
            }
        }
    }
}

/// Sanitize a string for use as a path component.
///
/// Unrestricted mode maps reserved characters to their full-width unicode
/// counterparts so titles stay readable; restricted mode replaces them with
/// underscores and drops anything non-ASCII.
pub fn sanitize_filename(s: &str, restricted: bool) -> String {
    const RESERVED: &str = "/\\|*<>:\"?";

    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_control() {
            continue;
        }
        if RESERVED.contains(ch) {
            if restricted {
                out.push('_');
            } else {
                // Full-width forms of the ASCII punctuation block.
                let mapped = match ch {
                    '/' => '\u{29F8}',
                    '\\' => '\u{29F9}',
                    other => char::from_u32(other as u32 + 0xFEE0).unwrap_or('_'),
                };
                out.push(mapped);
            }
        } else if restricted && (!ch.is_ascii() || "!&'()[]{}$;`^,#".contains(ch)) {
            out.push('_');
        } else if restricted && ch.is_whitespace() {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    // Collapse runs of substitute characters and trim the ends.
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_underscore = false;
    for ch in out.chars() {
        if ch == '_' {
            if !prev_underscore {
                collapsed.push(ch);
            }
            prev_underscore = true;
        } else {
            collapsed.push(ch);
            prev_underscore = false;
        }
    }
    let trimmed = collapsed.trim().trim_matches('_').trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("doc.json");

        atomic_write(&target, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");

        atomic_write(&target, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":2}");

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.lock");
        let lock = FileLock::with_timeouts(
            path.clone(),
            Duration::from_millis(200),
            Duration::from_secs(300),
        );

        let guard = lock.acquire().unwrap();
        assert!(path.exists());

        let second = FileLock::with_timeouts(
            path.clone(),
            Duration::from_millis(200),
            Duration::from_secs(300),
        );
        assert!(second.acquire().is_err());

        drop(guard);
        assert!(!path.exists());
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.lock");
        // A lock stamped far in the past.
        fs::write(&path, "12345\n10.0").unwrap();

        let lock = FileLock::with_timeouts(
            path.clone(),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        let guard = lock.acquire();
        assert!(guard.is_ok());
    }

    #[test]
    fn sanitize_maps_reserved_characters() {
        assert_eq!(sanitize_filename("Re:Zero", false), "Re\u{FF1A}Zero");
        assert_eq!(sanitize_filename("a/b", true), "a_b");
        assert_eq!(sanitize_filename("", false), "_");
        assert_eq!(sanitize_filename("Fate / Stay Night", true), "Fate_Stay_Night");
    }
}

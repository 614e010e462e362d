//! Per-name advisory cross-process lock.
//!
//! Implemented as exclusive creation of `<tmp>/<sha1(name)>.lock`: open
//! create-if-not-exists-else-fail, write an ISO timestamp, close. Contention
//! is resolved by watching the lock file for removal via `notify` rather than
//! busy-polling; if the platform watcher fails to install, a bounded poll
//! loop is the documented fallback.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{RecursiveMode, Watcher};
use sha1::{Digest as _, Sha1};

use crate::cancel::Cancel;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn lock_path(name: &str) -> PathBuf {
    let mut h = Sha1::new();
    h.update(name.as_bytes());
    let digest = hex::encode(h.finalize());
    std::env::temp_dir().join(format!("{digest}.lock"))
}

/// A held advisory lock. Unlinks its file on drop, regardless of how the
/// scope is exited.
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Release the lock early. Idempotent; ENOENT is benign.
    pub fn release(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Try to acquire the lock for `name` without blocking.
pub fn acquire(name: &str) -> Result<Option<LockGuard>> {
    let path = lock_path(name);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let stamp = format!("{}.{:09}", now.as_secs(), now.subsec_nanos());
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut f) => {
            f.write_all(stamp.as_bytes()).map_err(Error::Io)?;
            Ok(Some(LockGuard { path, released: false }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Acquire the lock for `name`, waiting up to `timeout` for a concurrent
/// holder to release it. Honors `cancel`.
pub fn acquire_wait(name: &str, timeout: Duration, cancel: &Cancel) -> Result<Option<LockGuard>> {
    if let Some(g) = acquire(name)? {
        return Ok(Some(g));
    }
    let _span = crate::observer::observer().span("lock.contention");
    let path = lock_path(name);
    let deadline = std::time::Instant::now() + timeout;
    let (tx, rx) = std::sync::mpsc::channel();
    let watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    });

    let mut watcher = match watcher {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "lock watcher unavailable, falling back to polling");
            None
        }
    };
    if let Some(w) = watcher.as_mut() {
        if let Some(parent) = path.parent() {
            if w.watch(parent, RecursiveMode::NonRecursive).is_err() {
                watcher = None;
            }
        }
    }

    crate::observer::observer().lock_wait(name);
    loop {
        cancel.check()?;
        if std::time::Instant::now() >= deadline {
            return Ok(None);
        }
        if let Some(g) = acquire(name)? {
            return Ok(Some(g));
        }
        match &watcher {
            Some(_) => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                let wait = remaining.min(POLL_INTERVAL.max(Duration::from_millis(1)));
                match rx.recv_timeout(wait) {
                    Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
                }
            }
            None => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let name = format!("castore-test-{}", uuid::Uuid::new_v4());
        let guard = acquire(&name).unwrap();
        assert!(guard.is_some());
        assert!(acquire(&name).unwrap().is_none());
        drop(guard);
        assert!(acquire(&name).unwrap().is_some());
    }

    #[test]
    fn acquire_wait_unblocks_on_release() {
        let name = format!("castore-test-wait-{}", uuid::Uuid::new_v4());
        let guard = acquire(&name).unwrap().unwrap();
        let name2 = name.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(guard);
        });
        let cancel = Cancel::new();
        let got = acquire_wait(&name2, Duration::from_secs(5), &cancel).unwrap();
        assert!(got.is_some());
        handle.join().unwrap();
    }
}

//! Retirement checks for a resident server: idle timeout and target rebuilds.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

/// Why the server should stop serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// No client activity for longer than the idle timeout.
    IdleTimeout,
    /// The target tool was rewritten (or removed) since startup.
    TargetChanged,
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetireReason::IdleTimeout => f.write_str("idle timeout"),
            RetireReason::TargetChanged => f.write_str("target changed"),
        }
    }
}

/// Snapshot of the target taken at startup plus the idle threshold.
#[derive(Debug, Clone)]
pub struct ServerMonitor {
    target: PathBuf,
    started_modified: Option<SystemTime>,
    idle_timeout: Duration,
}

impl ServerMonitor {
    /// `idle_timeout` of zero disables the idle check.
    pub fn new(target: &Path, idle_timeout: Duration) -> Self {
        Self {
            target: target.to_path_buf(),
            started_modified: modified(target),
            idle_timeout,
        }
    }

    /// Evaluate both conditions. `busy` suppresses the idle check while a run
    /// is in progress.
    pub fn check(&self, last_activity: Instant, busy: bool) -> Option<RetireReason> {
        if self.target_changed() {
            return Some(RetireReason::TargetChanged);
        }
        if !busy && !self.idle_timeout.is_zero() && last_activity.elapsed() > self.idle_timeout {
            return Some(RetireReason::IdleTimeout);
        }
        None
    }

    /// A missing target counts as changed.
    pub fn target_changed(&self) -> bool {
        let current = modified(&self.target);
        if current != self.started_modified {
            debug!(
                target = %self.target.display(),
                "Target last-write time differs from startup"
            );
            return true;
        }
        false
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn target() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tool.so");
        fs::write(&path, b"v1").unwrap();
        (tmp, path)
    }

    fn set_modified(path: &Path, secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn test_fresh_server_keeps_running() {
        let (_tmp, path) = target();
        let monitor = ServerMonitor::new(&path, Duration::from_secs(60));
        assert_eq!(monitor.check(Instant::now(), false), None);
    }

    #[test]
    fn test_idle_timeout_elapses() {
        let (_tmp, path) = target();
        let monitor = ServerMonitor::new(&path, Duration::from_millis(20));
        let last = Instant::now();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(monitor.check(last, false), Some(RetireReason::IdleTimeout));
        assert_eq!(monitor.check(last, true), None);
    }

    #[test]
    fn test_zero_idle_timeout_never_fires() {
        let (_tmp, path) = target();
        let monitor = ServerMonitor::new(&path, Duration::ZERO);
        let last = Instant::now();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(monitor.check(last, false), None);
    }

    #[test]
    fn test_rewritten_target_detected() {
        let (_tmp, path) = target();
        set_modified(&path, 1_000);
        let monitor = ServerMonitor::new(&path, Duration::ZERO);
        set_modified(&path, 2_000);
        assert_eq!(
            monitor.check(Instant::now(), true),
            Some(RetireReason::TargetChanged)
        );
    }

    #[test]
    fn test_removed_target_detected() {
        let (_tmp, path) = target();
        let monitor = ServerMonitor::new(&path, Duration::ZERO);
        fs::remove_file(&path).unwrap();
        assert!(monitor.target_changed());
    }
}

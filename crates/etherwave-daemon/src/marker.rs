use std::path::PathBuf;

use tracing::warn;

/// Externally visible long-running-task marker: a pid-stamped file that
/// exists exactly while the daemon is doing observable playback work.
/// Acquired before the first engine operation, always released on the
/// transition to Idle.  Session tooling watches it to keep the machine from
/// suspending mid-stream.
pub struct TaskMarker {
    path: PathBuf,
    active: bool,
}

impl TaskMarker {
    pub fn new(path: PathBuf) -> Self {
        // Clean up after a previous unclean shutdown
        let _ = std::fs::remove_file(&path);
        Self {
            path,
            active: false,
        }
    }

    pub fn acquire(&mut self) {
        if self.active {
            return;
        }
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(&self.path, format!("{}\n", std::process::id())) {
            Ok(()) => self.active = true,
            Err(e) => warn!("failed to write task marker {:?}: {}", self.path, e),
        }
    }

    pub fn release(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove task marker {:?}: {}", self.path, e);
        }
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for TaskMarker {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.active");
        let mut marker = TaskMarker::new(path.clone());

        marker.acquire();
        assert!(path.exists());
        assert!(marker.is_active());

        // Idempotent
        marker.acquire();
        assert!(path.exists());

        marker.release();
        assert!(!path.exists());
        marker.release(); // no panic on double release
    }

    #[test]
    fn drop_releases_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.active");
        {
            let mut marker = TaskMarker::new(path.clone());
            marker.acquire();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}

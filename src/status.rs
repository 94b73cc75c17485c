/// Status file: describes the live settings watch session as JSON so an
/// operator can tell whether it is still polling.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::watcher::WatchHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Watch session states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Watching,
    /// The watch task exited; `last_error` says why when it failed.
    Stopped,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SessionState,
    pub interval_secs: u64,
    pub checks: u64,
    pub updates: u64,
    pub revision: Option<String>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".dingdongditch.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Builds [`StatusData`] from a watch handle for each write.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    interval: Duration,
    started_at: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, interval: Duration) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            interval,
            started_at: Utc::now(),
        }
    }

    /// Snapshot the session and write it. Failures are logged, not returned.
    pub fn update(&self, state: SessionState, watch: Option<&WatchHandle>, revision: Option<String>) {
        let data = StatusData {
            pid: self.pid,
            state,
            interval_secs: self.interval.as_secs(),
            checks: watch.map_or(0, WatchHandle::checks),
            updates: watch.map_or(0, WatchHandle::updates),
            revision,
            last_error: watch.and_then(WatchHandle::last_error),
            started_at: self.started_at,
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Remove the status file on clean shutdown.
    pub fn finish(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

use crate::paths::AppPaths;
use crate::status::StatusSink;
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BATCH_LOG_ROTATE_BYTES: u64 = 5 * 1024 * 1024;
const BATCH_LOG_MAX_BACKUPS: usize = 3;
const BATCH_LOG_MAX_AGE_DAYS: u64 = 30;

/// Append-only JSONL record of one download session under
/// `logs/batches/<batch_id>.jsonl`.
#[derive(Debug)]
pub struct BatchLog {
    batch_id: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BatchLog {
    pub fn create(paths: &AppPaths) -> Result<Self> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir_all(paths.batch_logs_dir())?;
        let path = paths.batch_logs_dir().join(format!("{batch_id}.jsonl"));
        Ok(Self {
            batch_id,
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "batch_id": self.batch_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        rotate_if_needed(&self.path, BATCH_LOG_ROTATE_BYTES, BATCH_LOG_MAX_BACKUPS)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// [`record`](Self::record), downgrading a write failure to a warning.
    /// Returns whether the line was written.
    pub fn record_or_warn(&self, level: &str, event: &str, data: serde_json::Value) -> bool {
        match self.record(level, event, data) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, batch_id = %self.batch_id, event, "failed to append batch log line");
                false
            }
        }
    }

    /// Sink that records every status message here before passing it on.
    pub fn tee(self: &Arc<Self>, downstream: StatusSink) -> StatusSink {
        let log = Arc::clone(self);
        StatusSink::from_fn(move |message| {
            log.record_or_warn("info", "status", serde_json::json!({ "message": message }));
            downstream.send(message);
        })
    }
}

fn rotate_if_needed(path: &Path, max_bytes: u64, max_backups: usize) -> std::io::Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if len < max_bytes {
        return Ok(());
    }

    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };
        if !src.exists() {
            continue;
        }
        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

/// Removes batch logs (and their rotated backups) older than the retention
/// window. Returns how many files were deleted.
pub fn prune_batch_logs(paths: &AppPaths) -> Result<usize> {
    prune_older_than(
        &paths.batch_logs_dir(),
        Duration::from_secs(BATCH_LOG_MAX_AGE_DAYS * 24 * 60 * 60),
    )
}

fn prune_older_than(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(UNIX_EPOCH);

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        if modified <= cutoff && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

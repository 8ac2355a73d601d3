// src/utils/logging.rs
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "logs.txt";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Append-only request log at a fixed path, truncated at startup.
/// Appends are serialized; a write failure must never fail the request,
/// it is reported on the console and dropped.
pub struct RequestLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RequestLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match File::create(&path) {
            Ok(mut f) => {
                let header = format!(
                    "=== Fingerprint Matching Service Logs - Started at {} ===\n\n",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                );
                if let Err(e) = f.write_all(header.as_bytes()) {
                    warn!("failed to initialize {}: {}", path.display(), e);
                }
                Some(f)
            }
            Err(e) => {
                warn!("failed to initialize {}: {}", path.display(), e);
                None
            }
        };
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    pub fn append(&self, message: &str) {
        let mut guard = self.file.lock();
        if guard.is_none() {
            // The startup create may have raced a permission change; retry once.
            *guard = OpenOptions::new().append(true).open(&self.path).ok();
        }
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "[{}] {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("failed to write to {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn truncates_on_open_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs.txt");
        std::fs::write(&path, "stale contents\n").unwrap();

        let log = RequestLog::open(&path);
        log.append("first request");
        log.append("second request");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("stale contents"));
        assert!(contents.starts_with("=== Fingerprint Matching Service Logs"));
        assert!(contents.contains("first request"));
        assert!(contents.contains("second request"));
    }

    #[test]
    fn unwritable_path_is_swallowed() {
        let log = RequestLog::open("/nonexistent-dir/logs.txt");
        // Must not panic or error out.
        log.append("dropped");
    }
}

//! Append-only JSONL log with file-based persistence.
//!
//! Records are stored as newline-delimited JSON for simplicity and easy
//! inspection. Appends hold an in-process mutex and an exclusive file lock,
//! so concurrent writers (tasks or processes) never interleave lines.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors raised by the durable log
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record at line {line} of {}", .path.display())]
    Corrupt { path: PathBuf, line: usize },
}

/// File-backed append-only log of `T`
pub struct JsonlLog<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _records: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonlLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLog").field("path", &self.path).finish()
    }
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    /// Open a log, creating parent directories and an empty file if absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            _records: PhantomData,
        })
    }

    /// Path to the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    pub fn append(&self, record: &T) -> Result<(), LogError> {
        let json = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io(source))?;

        file.lock_exclusive().map_err(|source| self.io(source))?;
        let written = writeln!(file, "{}", json).and_then(|_| file.flush());
        // Unlock explicitly; closing the file would also release it
        let _ = FileExt::unlock(&file);

        written.map_err(|source| self.io(source))
    }

    /// Read every record in order. Fails on the first corrupt line.
    pub fn read_all(&self) -> Result<Vec<T>, LogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io(source)),
        };

        FileExt::lock_shared(&file).map_err(|source| self.io(source))?;
        let reader = BufReader::new(&file);
        let mut records = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| self.io(source))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|_| LogError::Corrupt {
                path: self.path.clone(),
                line: idx + 1,
            })?;
            records.push(record);
        }
        let _ = FileExt::unlock(&file);

        Ok(records)
    }

    /// Read every parsable record. A missing or unreadable file yields an
    /// empty list and corrupt lines are skipped.
    pub fn read_lenient(&self) -> Vec<T> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to read log");
                }
                return Vec::new();
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(idx, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "Skipping corrupt log line");
                    None
                }
            })
            .collect()
    }

    fn io(&self, source: std::io::Error) -> LogError {
        LogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: usize,
    }

    fn open_log(temp: &TempDir) -> JsonlLog<Entry> {
        JsonlLog::open(temp.path().join("nested").join("log.jsonl")).unwrap()
    }

    #[test]
    fn test_open_creates_empty_log() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);

        assert!(log.path().exists());
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);

        for seq in 0..5 {
            log.append(&Entry { seq }).unwrap();
        }

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.seq, i);
        }
    }

    #[test]
    fn test_reopen_keeps_existing_records() {
        let temp = TempDir::new().unwrap();
        open_log(&temp).append(&Entry { seq: 1 }).unwrap();

        let reopened = open_log(&temp);
        reopened.append(&Entry { seq: 2 }).unwrap();

        assert_eq!(reopened.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_line_handling() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        log.append(&Entry { seq: 1 }).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        log.append(&Entry { seq: 2 }).unwrap();

        assert!(matches!(log.read_all(), Err(LogError::Corrupt { line: 2, .. })));
        assert_eq!(log.read_lenient(), vec![Entry { seq: 1 }, Entry { seq: 2 }]);
    }

    #[test]
    fn test_lenient_read_of_missing_file() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp);
        fs::remove_file(log.path()).unwrap();

        assert!(log.read_lenient().is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(open_log(&temp));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.append(&Entry { seq: t * 100 + i }).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(log.read_all().unwrap().len(), 200);
    }
}

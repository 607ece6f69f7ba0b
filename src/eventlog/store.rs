//! Append-only event log file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::models::MeasurementRecord;

/// Log storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("log store is no longer available")]
    Closed,
}

/// Exclusive append handle over the log file.
///
/// Exactly one `LogStore` exists per log; it is moved into the ingestion
/// task and never shared, so the file needs no lock.
pub struct LogStore {
    path: PathBuf,
    file: File,
    /// A failed append left bytes that could not be cut off.
    torn: bool,
}

impl LogStore {
    /// Open (or create) the log for appending.
    ///
    /// If the file ends with a torn line, a newline is written first so the
    /// next batch starts on its own line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        if ends_with_torn_line(&mut file).map_err(io_err)? {
            tracing::warn!("Log {} ends with a partial line, terminating it", path.display());
            file.write_all(b"\n").map_err(io_err)?;
        }

        Ok(Self {
            path,
            file,
            torn: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a pre-encoded batch with a single write.
    ///
    /// A failed write never leaves a partial line for the next batch to
    /// merge into: the file is cut back to its previous length, or, if that
    /// fails too, the next append starts with a newline.
    pub fn append(&mut self, batch: &[u8]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        if self.torn {
            self.write(b"\n")?;
            self.torn = false;
        }

        let start = self.file.metadata().map_err(|e| self.io_error(e))?.len();
        if let Err(e) = self.write(batch) {
            self.discard_from(start);
            return Err(e);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.file
            .write_all(bytes)
            .and_then(|_| self.file.flush())
            .map_err(|e| self.io_error(e))
    }

    fn discard_from(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            tracing::error!(
                "Could not truncate {} after a failed append, next batch starts a new line: {}",
                self.path.display(),
                e
            );
            self.torn = true;
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Encode records as newline-delimited JSON, one record per line.
pub fn encode_batch(records: &[MeasurementRecord]) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::with_capacity(records.len() * 160);
    for r in records {
        serde_json::to_writer(&mut out, r)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn ends_with_torn_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::Protocol;
    use tempfile::tempdir;

    #[test]
    fn test_append_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut store = LogStore::open(&path).unwrap();

        let batch = encode_batch(&[
            MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 1.5),
            MeasurementRecord::error(Protocol::Tcp, "10.0.0.1:80", "connection refused"),
        ])
        .unwrap();
        store.append(&batch).unwrap();
        store.append(&[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(content.ends_with('\n'));
        assert!(lines[1].contains("connection refused"));
    }

    #[test]
    fn test_open_terminates_torn_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"timestamp\":\"2025-").unwrap();

        let mut store = LogStore::open(&path).unwrap();
        let batch =
            encode_batch(&[MeasurementRecord::success(Protocol::Udp, "10.0.0.1:53", 3.0)]).unwrap();
        store.append(&batch).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(serde_json::from_str::<MeasurementRecord>(lines[1]).is_ok());
    }

    fn parsed_lines(path: &Path) -> (usize, usize) {
        let content = std::fs::read_to_string(path).unwrap();
        let ok = content
            .lines()
            .filter(|l| serde_json::from_str::<MeasurementRecord>(l).is_ok())
            .count();
        (ok, content.lines().count() - ok)
    }

    #[test]
    fn test_failed_append_is_cut_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut store = LogStore::open(&path).unwrap();
        let first =
            encode_batch(&[MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 1.0)]).unwrap();
        store.append(&first).unwrap();

        // a write that died halfway through its batch
        let start = store.file.metadata().unwrap().len();
        store.file.write_all(b"{\"timestamp\":\"2025-12-30T05:4").unwrap();
        store.discard_from(start);
        assert!(!store.torn);

        let retry =
            encode_batch(&[MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 2.0)]).unwrap();
        store.append(&retry).unwrap();
        assert_eq!(parsed_lines(&path), (2, 0));
    }

    #[test]
    fn test_uncut_fragment_gets_its_own_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut store = LogStore::open(&path).unwrap();

        store.file.write_all(b"{\"timestamp\":\"2025-12-30T05:4").unwrap();
        store.torn = true;

        let batch = encode_batch(&[
            MeasurementRecord::success(Protocol::Tcp, "10.0.0.1:80", 4.0),
            MeasurementRecord::success(Protocol::Tcp, "10.0.0.1:80", 5.0),
        ])
        .unwrap();
        store.append(&batch).unwrap();

        // the fragment stays malformed, both records survive intact
        assert_eq!(parsed_lines(&path), (2, 1));
        assert!(!store.torn);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_append_to_full_device_fails_cleanly() {
        let Ok(mut store) = LogStore::open("/dev/full") else {
            return;
        };
        let batch =
            encode_batch(&[MeasurementRecord::success(Protocol::Udp, "10.0.0.1:53", 1.0)]).unwrap();
        assert!(matches!(store.append(&batch), Err(StoreError::Io { .. })));
        assert!(matches!(store.append(&batch), Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/log.jsonl");
        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }
}

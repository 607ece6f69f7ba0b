//! Streaming cursor over the event log.

use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Take};

use super::models::MeasurementRecord;

/// Reads the log from the start up to the length it had when opened.
///
/// Bytes appended after `open` are not visible to this cursor, and a final
/// line without its terminating newline is never parsed.
pub struct LogCursor {
    reader: BufReader<Take<File>>,
    buf: Vec<u8>,
    offset: u64,
    malformed: u64,
    truncated: u64,
}

impl LogCursor {
    pub async fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();

        Ok(Self {
            reader: BufReader::new(file.take(len)),
            buf: Vec::with_capacity(256),
            offset: 0,
            malformed: 0,
            truncated: 0,
        })
    }

    /// Next well-formed record, skipping (and tallying) anything else.
    pub async fn next_record(&mut self) -> io::Result<Option<MeasurementRecord>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.offset += n as u64;

            if self.buf.last() != Some(&b'\n') {
                self.truncated += 1;
                return Ok(None);
            }

            let line = trim_line(&self.buf);
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<MeasurementRecord>(line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    tracing::debug!("Skipping malformed log line at byte {}: {}", self.offset, e);
                    self.malformed += 1;
                }
            }
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Unterminated trailing lines seen (0 or 1).
    pub fn truncated(&self) -> u64 {
        self.truncated
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

//! Windowed aggregation over the event log.

mod stats;

pub use stats::*;

use crate::eventlog::{LogCursor, Protocol};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Query error types.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("{0}")]
    Validation(String),
    #[error("Resource related to latency measurement not found")]
    Unavailable(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unit of a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUnit {
    Minutes,
    Hours,
    Days,
}

/// A trailing window such as `5m`, `1h` or `7d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub magnitude: u32,
    pub unit: WindowUnit,
}

impl Window {
    pub fn duration(&self) -> ChronoDuration {
        let n = i64::from(self.magnitude);
        match self.unit {
            WindowUnit::Minutes => ChronoDuration::minutes(n),
            WindowUnit::Hours => ChronoDuration::hours(n),
            WindowUnit::Days => ChronoDuration::days(n),
        }
    }

    /// Oldest timestamp still inside the window ending at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl FromStr for Window {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static WINDOW_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let invalid = || {
            QueryError::Validation(format!(
                "invalid window '{}' (use <n>m, <n>h or <n>d, e.g. 5m, 1h, 1d)",
                s
            ))
        };

        let caps = WINDOW_RE
            .get_or_init(|| Regex::new(r"^(?P<value>\d+)(?P<unit>[mhd])$").ok())
            .as_ref()
            .and_then(|re| re.captures(s))
            .ok_or_else(invalid)?;

        let magnitude: u32 = caps["value"].parse().map_err(|_| invalid())?;
        if magnitude == 0 {
            return Err(invalid());
        }
        let unit = match &caps["unit"] {
            "m" => WindowUnit::Minutes,
            "h" => WindowUnit::Hours,
            _ => WindowUnit::Days,
        };

        Ok(Self { magnitude, unit })
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            WindowUnit::Minutes => 'm',
            WindowUnit::Hours => 'h',
            WindowUnit::Days => 'd',
        };
        write!(f, "{}{}", self.magnitude, unit)
    }
}

/// Aggregate over one protocol and window. Built per query, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    /// Records in scope, whatever their status.
    pub count: u64,
    pub success_count: u64,
    /// `success_count / count`, 0 for an empty window.
    pub success_rate: f64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// `None` when no successful record carries a duration.
    pub stats: Option<LatencyStats>,
    pub percentiles: Option<Percentiles>,
    /// Malformed or unterminated lines skipped by the scan.
    pub skipped_lines: u64,
}

/// Read-only aggregation over the log file.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    path: PathBuf,
}

impl QueryEngine {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate raw request parameters before any scanning happens.
    pub fn parse_request(protocol: &str, window: &str) -> Result<(Protocol, Window), QueryError> {
        let protocol = protocol.parse::<Protocol>().map_err(QueryError::Validation)?;
        let window = window.parse::<Window>()?;
        Ok((protocol, window))
    }

    pub async fn query(
        &self,
        protocol: Protocol,
        window: &Window,
    ) -> Result<AggregationResult, QueryError> {
        self.query_at(protocol, window, Utc::now()).await
    }

    /// Aggregate records of `protocol` with `timestamp >= now - window`.
    pub async fn query_at(
        &self,
        protocol: Protocol,
        window: &Window,
        now: DateTime<Utc>,
    ) -> Result<AggregationResult, QueryError> {
        let cutoff = window.cutoff(now);

        let mut cursor = LogCursor::open(&self.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => QueryError::Unavailable(self.path.clone()),
            _ => self.io_error(e),
        })?;

        let mut count = 0u64;
        let mut success_count = 0u64;
        let mut first_seen: Option<DateTime<Utc>> = None;
        let mut last_seen: Option<DateTime<Utc>> = None;
        let mut durations = Vec::new();

        while let Some(record) = cursor.next_record().await.map_err(|e| self.io_error(e))? {
            if record.protocol != protocol || record.timestamp < cutoff {
                continue;
            }

            count += 1;
            first_seen = Some(first_seen.map_or(record.timestamp, |t| t.min(record.timestamp)));
            last_seen = Some(last_seen.map_or(record.timestamp, |t| t.max(record.timestamp)));

            if record.is_success() {
                success_count += 1;
                if let Some(ms) = record.duration_ms {
                    durations.push(ms);
                }
            }
        }

        let skipped_lines = cursor.malformed() + cursor.truncated();
        if skipped_lines > 0 {
            tracing::warn!(
                "Skipped {} unreadable lines while scanning {}",
                skipped_lines,
                self.path.display()
            );
        }

        tracing::debug!(
            "Scanned {} bytes of {}: {} {} records since {}",
            cursor.offset(),
            self.path.display(),
            count,
            protocol,
            cutoff
        );

        let success_rate = if count == 0 {
            0.0
        } else {
            success_count as f64 / count as f64
        };
        let (stats, percentiles) = match summarize(durations) {
            Some((s, p)) => (Some(s), Some(p)),
            None => (None, None),
        };

        Ok(AggregationResult {
            count,
            success_count,
            success_rate,
            first_seen,
            last_seen,
            stats,
            percentiles,
            skipped_lines,
        })
    }

    fn io_error(&self, source: std::io::Error) -> QueryError {
        QueryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::{encode_batch, MeasurementRecord};
    use chrono::SubsecRound;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn at(record: MeasurementRecord, ts: DateTime<Utc>) -> MeasurementRecord {
        MeasurementRecord {
            timestamp: ts,
            ..record
        }
    }

    fn write_log(records: &[MeasurementRecord]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&encode_batch(records).unwrap()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    // log lines keep millisecond precision
    fn now_ms() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    fn window(s: &str) -> Window {
        s.parse().unwrap()
    }

    #[test]
    fn test_window_parse() {
        assert_eq!(window("5m").duration(), ChronoDuration::minutes(5));
        assert_eq!(window("2h").duration(), ChronoDuration::hours(2));
        assert_eq!(window("7d").duration(), ChronoDuration::days(7));
        assert_eq!(window("15m").to_string(), "15m");

        for bad in ["", "5", "m", "5s", "-5m", "0m", "5 m", "1.5h", "99999999999d"] {
            assert!(bad.parse::<Window>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_parse_request_rejects_before_scan() {
        assert_ok!(QueryEngine::parse_request("udp", "1h"));
        assert!(matches!(
            QueryEngine::parse_request("ftp", "5m"),
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            QueryEngine::parse_request("icmp", "5x"),
            Err(QueryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_three_icmp_records_in_window() {
        let now = now_ms();
        let log = write_log(&[
            at(MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 1.0), now - ChronoDuration::minutes(10)),
            at(MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 2.0), now - ChronoDuration::minutes(5)),
            at(MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 3.0), now - ChronoDuration::minutes(1)),
        ]);

        let engine = QueryEngine::new(log.path());
        let result = engine.query_at(Protocol::Icmp, &window("15m"), now).await.unwrap();

        assert_eq!(result.count, 3);
        assert_eq!(result.success_rate, 1.0);
        let stats = result.stats.unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.avg, 2.0);
        assert_eq!(stats.med, 2.0);
        assert_eq!(result.percentiles.unwrap().p50, 2.0);
    }

    #[tokio::test]
    async fn test_failures_count_but_do_not_skew_latency() {
        let now = now_ms();
        let recent = now - ChronoDuration::seconds(30);
        let log = write_log(&[
            at(MeasurementRecord::success(Protocol::Udp, "h:53", 4.0), recent),
            at(MeasurementRecord::timeout(Protocol::Udp, "h:53", "request timed out"), recent),
            at(MeasurementRecord::error(Protocol::Udp, "h:53", "network error"), recent),
            at(MeasurementRecord::success(Protocol::Udp, "h:53", 8.0), recent),
            // other protocol and out-of-window records are excluded
            at(MeasurementRecord::success(Protocol::Tcp, "h:80", 100.0), recent),
            at(MeasurementRecord::success(Protocol::Udp, "h:53", 900.0), now - ChronoDuration::minutes(6)),
        ]);

        let engine = QueryEngine::new(log.path());
        let result = engine.query_at(Protocol::Udp, &window("5m"), now).await.unwrap();

        assert_eq!(result.count, 4);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.success_rate, 0.5);
        let stats = result.stats.unwrap();
        assert_eq!((stats.min, stats.max, stats.avg), (4.0, 8.0, 6.0));
        assert_eq!(result.first_seen, Some(recent));
        assert_eq!(result.last_seen, Some(recent));
    }

    #[tokio::test]
    async fn test_cutoff_is_inclusive() {
        let now = now_ms();
        let log = write_log(&[at(
            MeasurementRecord::success(Protocol::Tcp, "h:80", 1.0),
            now - ChronoDuration::minutes(5),
        )]);

        let engine = QueryEngine::new(log.path());
        let result = engine.query_at(Protocol::Tcp, &window("5m"), now).await.unwrap();
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_empty_window() {
        let log = write_log(&[MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 1.0)]);

        let engine = QueryEngine::new(log.path());
        let result = engine.query(Protocol::Http, &window("5m")).await.unwrap();

        assert_eq!(result.count, 0);
        assert_eq!(result.success_rate, 0.0);
        assert!(result.stats.is_none());
        assert!(result.percentiles.is_none());
        assert!(result.first_seen.is_none());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped() {
        let mut log = write_log(&[
            MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 1.0),
            MeasurementRecord::success(Protocol::Icmp, "10.0.0.1", 3.0),
        ]);
        log.write_all(b"{\"timestamp\":\"2025-12-30T05:4").unwrap();
        log.flush().unwrap();

        let engine = QueryEngine::new(log.path());
        let result = engine.query(Protocol::Icmp, &window("1h")).await.unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.stats.unwrap().avg, 2.0);
        assert_eq!(result.skipped_lines, 1);
    }

    #[tokio::test]
    async fn test_repeated_queries_are_identical() {
        let now = now_ms();
        let records: Vec<_> = (0..200)
            .map(|i| {
                at(
                    MeasurementRecord::success(Protocol::Http, "http://h/", (i % 37) as f64 * 1.3),
                    now - ChronoDuration::seconds(i),
                )
            })
            .collect();
        let log = write_log(&records);

        let engine = QueryEngine::new(log.path());
        let first = engine.query_at(Protocol::Http, &window("1h"), now).await.unwrap();
        let second = engine.query_at(Protocol::Http, &window("1h"), now).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.count, 200);
    }

    #[tokio::test]
    async fn test_missing_log_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = QueryEngine::new(dir.path().join("absent.jsonl"));
        let result = engine.query(Protocol::Icmp, &window("5m")).await;
        assert!(matches!(assert_err!(result), QueryError::Unavailable(_)));
    }
}

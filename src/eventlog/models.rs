//! Event log record types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Probed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Icmp, Protocol::Udp, Protocol::Tcp, Protocol::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(Protocol::Icmp),
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "http" => Ok(Protocol::Http),
            other => Err(format!(
                "unknown protocol '{}' (expected icmp, udp, tcp or http)",
                other
            )),
        }
    }
}

/// Outcome class of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    Timeout,
    Error,
}

/// One probe attempt, exactly as it is stored on a log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    #[serde(with = "millis_utc")]
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub target: String,
    /// Round-trip in milliseconds, only present when a response arrived.
    pub duration_ms: Option<f64>,
    pub status: ProbeStatus,
    pub reason: Option<String>,
}

impl MeasurementRecord {
    pub fn success(protocol: Protocol, target: &str, duration_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            protocol,
            target: target.to_string(),
            duration_ms: Some(duration_ms.max(0.0)),
            status: ProbeStatus::Success,
            reason: None,
        }
    }

    pub fn timeout(protocol: Protocol, target: &str, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            protocol,
            target: target.to_string(),
            duration_ms: None,
            status: ProbeStatus::Timeout,
            reason: Some(reason.into()),
        }
    }

    pub fn error(protocol: Protocol, target: &str, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            protocol,
            target: target.to_string(),
            duration_ms: None,
            status: ProbeStatus::Error,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Render an instant the way log lines and API responses carry it,
/// e.g. `2025-12-30T05:42:18.123Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod millis_utc {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

//! Probe module for network latency measurement.
//!
//! Supports ICMP, UDP, TCP and HTTP probes. Every attempt, whatever its
//! outcome, comes back as exactly one [`MeasurementRecord`].

mod http;
mod icmp;
mod tcp;
mod udp;

pub use http::*;
pub use icmp::*;
pub use tcp::*;
pub use udp::*;

use crate::eventlog::{MeasurementRecord, Protocol};

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// These never leave this module; [`run_probe`] turns them into records.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout(Duration),
    #[error("no response: {0}")]
    NoResponse(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Status(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    /// Whether the peer simply never answered.
    pub fn is_unanswered(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::NoResponse(_))
    }
}

/// Per-protocol probe settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
    pub scheme: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ProtocolConfig {
    /// Settings for `protocol` against `host` with the default cadence.
    pub fn new(protocol: Protocol, host: &str) -> Self {
        let (interval, timeout, port) = match protocol {
            Protocol::Icmp => (2.0, 1.0, None),
            Protocol::Tcp => (5.0, 1.5, Some(80)),
            Protocol::Udp => (15.0, 1.0, Some(53)),
            Protocol::Http => (30.0, 3.0, None),
        };

        Self {
            protocol,
            host: host.to_string(),
            port,
            scheme: "http".to_string(),
            path: "/".to_string(),
            headers: Vec::new(),
            interval: Duration::from_secs_f64(interval),
            timeout: Duration::from_secs_f64(timeout),
        }
    }

    /// Smallest interval that does not overload the remote peer.
    pub fn interval_floor(protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Icmp => Duration::from_secs(1),
            Protocol::Tcp | Protocol::Udp => Duration::from_secs(2),
            Protocol::Http => Duration::from_secs(5),
        }
    }

    /// Raise the interval to its floor and cap the timeout at the interval.
    pub fn enforce_limits(&mut self) {
        let floor = Self::interval_floor(self.protocol);
        if self.interval < floor {
            tracing::warn!(
                "{} interval {:?} is below the {:?} floor, using the floor",
                self.protocol,
                self.interval,
                floor
            );
            self.interval = floor;
        }
        if self.timeout.is_zero() {
            self.timeout = ProtocolConfig::new(self.protocol, "").timeout.min(self.interval);
        } else if self.timeout > self.interval {
            tracing::warn!(
                "{} timeout {:?} exceeds the interval, capping at {:?}",
                self.protocol,
                self.timeout,
                self.interval
            );
            self.timeout = self.interval;
        }
    }

    /// The probed endpoint as it appears in records.
    pub fn target(&self) -> String {
        match self.protocol {
            Protocol::Icmp => self.host.clone(),
            Protocol::Tcp | Protocol::Udp => self.host_port(),
            Protocol::Http => self.url(),
        }
    }

    fn host_port(&self) -> String {
        let port = self.port.unwrap_or(0);
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.port {
            Some(_) => format!("{}://{}{}", self.scheme, self.host_port(), path),
            None if self.host.contains(':') => {
                format!("{}://[{}]{}", self.scheme, self.host, path)
            }
            None => format!("{}://{}{}", self.scheme, self.host, path),
        }
    }
}

/// Run one probe attempt and describe its outcome as a record.
pub async fn run_probe(config: &ProtocolConfig) -> MeasurementRecord {
    let target = config.target();

    let result = match config.protocol {
        Protocol::Icmp => run_icmp_probe(&config.host, config.timeout).await,
        Protocol::Tcp => run_tcp_probe(&target, config.timeout).await,
        Protocol::Udp => run_udp_probe(&target, config.timeout).await,
        Protocol::Http => run_http_probe(&target, &config.headers, config.timeout).await,
    };

    // Enforce timeout check
    let result = match result {
        Ok(ms) if ms >= config.timeout.as_secs_f64() * 1000.0 => {
            Err(ProbeError::Timeout(config.timeout))
        }
        other => other,
    };

    match result {
        Ok(ms) => {
            tracing::debug!("{} probe to {}: {:.3} ms", config.protocol, target, ms);
            MeasurementRecord::success(config.protocol, &target, ms)
        }
        Err(e) if e.is_unanswered() => {
            tracing::debug!("{} probe to {} unanswered: {}", config.protocol, target, e);
            MeasurementRecord::timeout(config.protocol, &target, e.to_string())
        }
        Err(e) => {
            tracing::debug!("{} probe to {} failed: {}", config.protocol, target, e);
            MeasurementRecord::error(config.protocol, &target, e.to_string())
        }
    }
}

/// Resolve a host name or literal address.
pub(crate) async fn resolve_host(host: &str) -> Result<IpAddr, ProbeError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((bare, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

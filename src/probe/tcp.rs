//! TCP connect probe.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::ProbeError;

/// Time the TCP handshake to `addr` (`host:port`), in milliseconds.
///
/// The connection is dropped as soon as it is established; no payload is
/// exchanged.
pub async fn run_tcp_probe(addr: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let start = Instant::now();

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("connect to {} failed: {}", addr, e)),
        })?;

    let elapsed = start.elapsed();
    drop(stream);

    Ok(elapsed.as_secs_f64() * 1000.0)
}

//! UDP echo probe.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::ProbeError;

/// Single-byte payload; the peer's echo service only has to answer.
const PAYLOAD: &[u8] = b"\x00";

/// Send one datagram to `addr` (`host:port`) and wait for any reply.
///
/// Returns latency in milliseconds. A missing reply is reported as a
/// timeout and never retried here.
pub async fn run_udp_probe(addr: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let peer: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", addr)))?;

    let bind_addr = if peer.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(peer)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(PAYLOAD)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 512];
    tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to receive: {}", e)))?;

    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_probe_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let ms = run_udp_probe(&addr, Duration::from_secs(1)).await.unwrap();
        assert!(ms < 1000.0);
    }

    #[tokio::test]
    async fn test_udp_probe_silent_peer_times_out() {
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();

        let err = run_udp_probe(&addr, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)), "got {:?}", err);
        drop(silent);
    }
}

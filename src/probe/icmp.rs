//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Native echo runs on blocking sockets inside `spawn_blocking` so the
//! receive timestamp is taken without scheduler jitter.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{resolve_host, ProbeError};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("ICMP probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `host` and return the round-trip in milliseconds.
pub async fn run_icmp_probe(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(host, timeout).await;
    }

    let ip = resolve_host(host).await?;
    let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("echo task failed: {}", e)))?;

    match result {
        Err(ProbeError::PermissionDenied(msg)) => {
            tracing::warn!(
                "Native ICMP to {} not permitted ({}), falling back to ping command",
                host,
                msg
            );
            run_ping_command(host, timeout).await
        }
        other => other,
    }
}

fn open_echo_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // RAW first (privileged), then DGRAM (unprivileged)
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e.to_string()),
            _ => ProbeError::Network(format!("failed to create ICMP socket: {}", e)),
        })
}

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (socket, raw) = open_echo_socket(ip)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let (packet, reply_type) = match ip {
        IpAddr::V4(_) => (build_echo_request(ECHO_REQUEST_V4, identifier, sequence), ECHO_REPLY_V4),
        IpAddr::V6(_) => (build_echo_request(ECHO_REQUEST_V6, identifier, sequence), ECHO_REPLY_V6),
    };

    let start = Instant::now();

    socket.send(&packet).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e.to_string()),
        _ => ProbeError::Network(format!("failed to send: {}", e)),
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_our_reply(&buf[..len], reply_type, identifier, sequence, raw) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
    }
}

/// Match an echo reply against the request we sent.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message.
/// DGRAM sockets get their identifier rewritten by the kernel, so only the
/// sequence number is compared there.
fn is_our_reply(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16, raw: bool) -> bool {
    let offset = if !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type && reply_seq == sequence && (!raw || reply_id == identifier)
}

/// Build an echo request: 8 byte header plus 56 byte payload.
///
/// ICMPv6 checksums are filled in by the kernel, so the field is only
/// computed for IPv4.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = kind;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if kind == ECHO_REQUEST_V4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [odd] = chunks.remainder() {
        sum += (*odd as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

async fn run_ping_command(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let child = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    // the command's own -W is whole seconds, so bound it from outside too
    let output = tokio::time::timeout(timeout + Duration::from_millis(500), child)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
        return Err(ProbeError::Command(format!("ping failed: {}", detail)));
    }

    let ms = parse_ping_output(&stdout)?;
    if ms >= timeout.as_secs_f64() * 1000.0 {
        return Err(ProbeError::Timeout(timeout));
    }
    Ok(ms)
}

/// Extract the round-trip in milliseconds from `ping` output.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    static PATTERNS: OnceLock<Vec<(Regex, usize)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // per-packet "time=X.XXX ms" (Linux, macOS)
            (r"time[=<]([0-9.]+)\s*ms", 1),
            // macOS summary, average column
            (r"round-trip\s+min/avg/max/stddev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
            // Linux summary, average column
            (r"rtt\s+min/avg/max/mdev\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)", 2),
        ]
        .into_iter()
        .filter_map(|(re, group)| Regex::new(re).ok().map(|re| (re, group)))
        .collect()
    });

    patterns
        .iter()
        .find_map(|(re, group)| {
            re.captures(output)
                .and_then(|caps| caps.get(*group))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

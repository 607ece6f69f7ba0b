//! HTTP probe implementation.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::{Duration, Instant};

use super::ProbeError;

/// Issue one GET to `url` and return the latency in milliseconds.
///
/// Any non-2xx answer is an error carrying the status line. Failures that
/// produce no response at all are reported as unanswered.
pub async fn run_http_probe(
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(0)
        .default_headers(build_headers(headers)?)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else if e.is_builder() {
            ProbeError::Config(e.to_string())
        } else {
            ProbeError::NoResponse(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_string()));
    }

    // Read the full body to measure complete transfer time
    response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

fn build_headers(headers: &[(String, String)]) -> Result<HeaderMap, ProbeError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProbeError::Config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProbeError::Config(format!("invalid header value for {}: {}", name, e)))?;
        map.append(name, value);
    }
    Ok(map)
}

//! Configuration module for probeline.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::eventlog::Protocol;
use crate::probe::ProtocolConfig;
use crate::scheduler::PipelineSettings;

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid protocol setting '{entry}': {reason}")]
    Setting { entry: String, reason: String },
    #[error("invalid protocol list: {0}")]
    Protocols(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the query service (default: 8080)
    pub http_port: u16,
    /// Path to the measurement log (default: "measurement.jsonl")
    pub log_path: String,
    /// Remote peer; no probes run when unset
    pub target: Option<String>,
    /// Per-protocol probe settings, empty when `target` is unset
    pub protocols: Vec<ProtocolConfig>,
    pub pipeline: PipelineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            log_path: "measurement.jsonl".to_string(),
            target: None,
            protocols: Vec::new(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PROBELINE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PROBELINE_LOG_PATH`: Log file path (default: "measurement.jsonl")
    /// - `PROBELINE_TARGET`: Remote peer address (default: unset, query-only)
    /// - `PROBELINE_PROTOCOLS`: Protocols to probe (default: "icmp,udp,tcp,http")
    /// - `PROBELINE_SETTINGS`: `protocol:key=value` entries separated by `,`,
    ///   or by `;` when any value (such as a header) itself contains a comma
    /// - `PROBELINE_BATCH_SIZE`: Writer batch size (default: 50)
    /// - `PROBELINE_FLUSH_INTERVAL`: Writer flush interval in seconds (default: 1.0)
    /// - `PROBELINE_DRAIN_TIMEOUT`: Shutdown drain bound in seconds (default: 5.0)
    /// - `PROBELINE_QUEUE_CAPACITY`: Per-protocol queue capacity (default: 1000)
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = lookup("PROBELINE_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(path) = lookup("PROBELINE_LOG_PATH").filter(|v| !v.trim().is_empty()) {
            cfg.log_path = path;
        }

        let ingest = &mut cfg.pipeline.ingest;
        if let Some(n) = lookup("PROBELINE_BATCH_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            ingest.batch_size = n.max(1);
        }
        if let Some(d) = lookup("PROBELINE_FLUSH_INTERVAL").and_then(|v| parse_seconds(&v)) {
            ingest.flush_interval = d;
        }
        if let Some(d) = lookup("PROBELINE_DRAIN_TIMEOUT").and_then(|v| parse_seconds(&v)) {
            ingest.drain_timeout = d;
        }
        if let Some(n) = lookup("PROBELINE_QUEUE_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            cfg.pipeline.queue_capacity = n.max(1);
        }

        cfg.target = lookup("PROBELINE_TARGET")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if let Some(target) = cfg.target.clone() {
            let protocols = match lookup("PROBELINE_PROTOCOLS") {
                Some(list) => parse_protocol_list(&list)?,
                None => Protocol::ALL.to_vec(),
            };
            let settings = lookup("PROBELINE_SETTINGS").unwrap_or_default();
            cfg.protocols = build_protocol_configs(&target, &protocols, &settings)?;
        }

        Ok(cfg)
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}

fn parse_protocol_list(list: &str) -> Result<Vec<Protocol>, ConfigError> {
    let mut protocols = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let protocol = name
            .to_lowercase()
            .parse::<Protocol>()
            .map_err(ConfigError::Protocols)?;
        if !protocols.contains(&protocol) {
            protocols.push(protocol);
        }
    }
    Ok(protocols)
}

/// Apply `protocol:key=value` (or `protocol_key=value`) entries on top of
/// the per-protocol defaults.
///
/// Entries are separated by `;` if the string contains one, otherwise by `,`.
pub fn build_protocol_configs(
    target: &str,
    protocols: &[Protocol],
    settings: &str,
) -> Result<Vec<ProtocolConfig>, ConfigError> {
    let mut configs: Vec<ProtocolConfig> = protocols
        .iter()
        .map(|&p| ProtocolConfig::new(p, target))
        .collect();

    let separator = if settings.contains(';') { ';' } else { ',' };
    for entry in settings.split(separator).map(str::trim).filter(|s| !s.is_empty()) {
        let fail = |reason: &str| ConfigError::Setting {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, value) = entry.split_once('=').ok_or_else(|| fail("expected key=value"))?;
        let (protocol, key) = lhs
            .split_once(':')
            .or_else(|| lhs.split_once('_'))
            .ok_or_else(|| fail("expected protocol:key"))?;
        let protocol = protocol
            .trim()
            .to_lowercase()
            .parse::<Protocol>()
            .map_err(|e| fail(&e))?;

        // settings for protocols that are not scheduled are ignored
        let Some(config) = configs.iter_mut().find(|c| c.protocol == protocol) else {
            continue;
        };
        apply_setting(config, &key.trim().to_lowercase(), value.trim()).map_err(|e| fail(&e))?;
    }

    for config in &mut configs {
        config.enforce_limits();
    }
    Ok(configs)
}

fn apply_setting(config: &mut ProtocolConfig, key: &str, value: &str) -> Result<(), String> {
    match key {
        "interval" => {
            config.interval = parse_seconds(value).ok_or("interval must be positive seconds")?;
        }
        "timeout" => {
            config.timeout = parse_seconds(value).ok_or("timeout must be positive seconds")?;
        }
        "port" if config.protocol != Protocol::Icmp => {
            let port: u16 = value.parse().map_err(|_| "port must be 1-65535")?;
            if port == 0 {
                return Err("port must be 1-65535".to_string());
            }
            config.port = Some(port);
        }
        "path" if config.protocol == Protocol::Http => {
            config.path = value.to_string();
        }
        "scheme" if config.protocol == Protocol::Http => match value.to_lowercase().as_str() {
            s @ ("http" | "https") => config.scheme = s.to_string(),
            _ => return Err("scheme must be http or https".to_string()),
        },
        "header" if config.protocol == Protocol::Http => {
            let (name, val) = value
                .split_once(':')
                .ok_or("header must look like 'Name: value'")?;
            config
                .headers
                .push((name.trim().to_string(), val.trim().to_string()));
        }
        other => return Err(format!("unknown key '{}' for {}", other, config.protocol)),
    }
    Ok(())
}

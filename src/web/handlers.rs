//! HTTP request handlers.

use super::AppState;
use crate::eventlog::{format_timestamp, Protocol};
use crate::query::{AggregationResult, LatencyStats, Percentiles, QueryEngine, QueryError};
use crate::scheduler::{MetricsSnapshot, SchedulerState};

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_PROTOCOL: &str = "icmp";
const DEFAULT_WINDOW: &str = "5m";

// ============================================================================
// Response envelope
// ============================================================================

/// A number with its unit, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measure {
    pub value: f64,
    pub unit: &'static str,
}

impl Measure {
    fn ms(value: f64) -> Self {
        Self {
            value: round3(value),
            unit: "ms",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Parameters {
    pub protocol: String,
    pub window: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub count: u64,
    pub success_rate: f64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub skipped_lines: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PercentileBody {
    pub p1: Measure,
    pub p5: Measure,
    pub p10: Measure,
    pub p25: Measure,
    pub p50: Measure,
    pub p75: Measure,
    pub p90: Measure,
    pub p95: Measure,
    pub p99: Measure,
}

impl From<&Percentiles> for PercentileBody {
    fn from(p: &Percentiles) -> Self {
        Self {
            p1: Measure::ms(p.p1),
            p5: Measure::ms(p.p5),
            p10: Measure::ms(p.p10),
            p25: Measure::ms(p.p25),
            p50: Measure::ms(p.p50),
            p75: Measure::ms(p.p75),
            p90: Measure::ms(p.p90),
            p95: Measure::ms(p.p95),
            p99: Measure::ms(p.p99),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsBody {
    pub min: Measure,
    pub max: Measure,
    pub avg: Measure,
    pub med: Measure,
}

impl From<&LatencyStats> for StatsBody {
    fn from(s: &LatencyStats) -> Self {
        Self {
            min: Measure::ms(s.min),
            max: Measure::ms(s.max),
            avg: Measure::ms(s.avg),
            med: Measure::ms(s.med),
        }
    }
}

/// Body of `GET /metrics`, shared by success and error replies.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub response_id: String,
    pub timestamp: String,
    pub status: &'static str,
    pub parameters: Parameters,
    pub observation: Option<Observation>,
    pub percentile: Option<PercentileBody>,
    pub stats: Option<StatsBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MetricsResponse {
    fn envelope(status: &'static str, parameters: Parameters) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: format_timestamp(&Utc::now()),
            status,
            parameters,
            observation: None,
            percentile: None,
            stats: None,
            detail: None,
        }
    }

    pub fn success(parameters: Parameters, result: &AggregationResult) -> Self {
        Self {
            observation: Some(Observation {
                count: result.count,
                success_rate: round3(result.success_rate),
                first_seen: result.first_seen.as_ref().map(format_timestamp),
                last_seen: result.last_seen.as_ref().map(format_timestamp),
                skipped_lines: result.skipped_lines,
            }),
            percentile: result.percentiles.as_ref().map(PercentileBody::from),
            stats: result.stats.as_ref().map(StatsBody::from),
            ..Self::envelope("success", parameters)
        }
    }

    pub fn failure(parameters: Parameters, detail: String) -> Self {
        Self {
            detail: Some(detail),
            ..Self::envelope("error", parameters)
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ============================================================================
// API: Metrics
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
}

fn normalize(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub async fn handle_metrics(
    State(state): State<AppState>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> impl IntoResponse {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            let parameters = Parameters {
                protocol: String::new(),
                window: String::new(),
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(MetricsResponse::failure(parameters, rejection.body_text())),
            )
                .into_response();
        }
    };

    let parameters = Parameters {
        protocol: normalize(query.protocol, DEFAULT_PROTOCOL),
        window: normalize(query.window, DEFAULT_WINDOW),
    };

    let result = match QueryEngine::parse_request(&parameters.protocol, &parameters.window) {
        Ok((protocol, window)) => state.engine.query(protocol, &window).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(aggregation) => Json(MetricsResponse::success(parameters, &aggregation)).into_response(),
        Err(e) => {
            let status = match &e {
                QueryError::Validation(_) => StatusCode::BAD_REQUEST,
                QueryError::Unavailable(path) => {
                    tracing::warn!("Metrics query with no log at {}", path.display());
                    StatusCode::SERVICE_UNAVAILABLE
                }
                QueryError::Io { .. } => {
                    tracing::error!("Metrics query failed: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(MetricsResponse::failure(parameters, e.to_string()))).into_response()
        }
    }
}

// ============================================================================
// Health and status
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "timestamp": format_timestamp(&Utc::now()),
        "timezone": "UTC",
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub timestamp: String,
    pub log_path: String,
    pub target: Option<String>,
    pub schedulers: BTreeMap<Protocol, SchedulerState>,
    pub pipeline: MetricsSnapshot,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        timestamp: format_timestamp(&Utc::now()),
        log_path: state.config.log_path.clone(),
        target: state.config.target.clone(),
        schedulers: state.schedulers.snapshot(),
        pipeline: state.metrics.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::eventlog::{encode_batch, MeasurementRecord};
    use crate::scheduler::{PipelineMetrics, SchedulerStates};
    use axum::response::Response;
    use std::path::Path;
    use std::sync::Arc;

    fn state_for(path: &Path) -> AppState {
        let config = ServerConfig {
            log_path: path.display().to_string(),
            ..Default::default()
        };
        AppState {
            engine: QueryEngine::new(&config.log_path),
            config,
            metrics: Arc::new(PipelineMetrics::new()),
            schedulers: SchedulerStates::default(),
        }
    }

    fn query(
        protocol: Option<&str>,
        window: Option<&str>,
    ) -> Result<Query<MetricsQuery>, QueryRejection> {
        Ok(Query(MetricsQuery {
            protocol: protocol.map(str::to_string),
            window: window.map(str::to_string),
        }))
    }

    async fn body_json(resp: Response) -> (StatusCode, serde_json::Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn write_log(path: &Path, records: &[MeasurementRecord]) {
        std::fs::write(path, encode_batch(records).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_metrics_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        write_log(
            &path,
            &[
                MeasurementRecord::success(Protocol::Icmp, "8.8.8.8", 1.0),
                MeasurementRecord::success(Protocol::Icmp, "8.8.8.8", 2.0),
                MeasurementRecord::success(Protocol::Icmp, "8.8.8.8", 3.0),
                MeasurementRecord::success(Protocol::Tcp, "8.8.8.8:80", 9.0),
            ],
        );

        let resp = handle_metrics(State(state_for(&path)), query(Some(" ICMP "), Some("15m")))
            .await
            .into_response();
        let (status, body) = body_json(resp).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["response_id"].as_str().unwrap().len(), 32);
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(body["parameters"]["protocol"], "icmp");
        assert_eq!(body["parameters"]["window"], "15m");
        assert_eq!(body["observation"]["count"], 3);
        assert_eq!(body["observation"]["success_rate"], 1.0);
        assert_eq!(body["stats"]["min"]["value"], 1.0);
        assert_eq!(body["stats"]["max"]["value"], 3.0);
        assert_eq!(body["stats"]["avg"]["value"], 2.0);
        assert_eq!(body["stats"]["med"]["value"], 2.0);
        assert_eq!(body["stats"]["med"]["unit"], "ms");
        assert_eq!(body["percentile"]["p50"]["value"], 2.0);
        assert_eq!(body["percentile"]["p99"]["value"], 2.98);
        assert!(body.get("detail").is_none());
    }

    #[tokio::test]
    async fn test_metrics_defaults_and_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        write_log(
            &path,
            &[MeasurementRecord::timeout(Protocol::Udp, "h:53", "request timed out")],
        );

        let resp = handle_metrics(State(state_for(&path)), query(None, None))
            .await
            .into_response();
        let (status, body) = body_json(resp).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["parameters"]["protocol"], "icmp");
        assert_eq!(body["parameters"]["window"], "5m");
        assert_eq!(body["observation"]["count"], 0);
        assert_eq!(body["observation"]["success_rate"], 0.0);
        assert!(body["observation"]["first_seen"].is_null());
        assert!(body["stats"].is_null());
        assert!(body["percentile"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_rounds_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        write_log(
            &path,
            &[
                MeasurementRecord::success(Protocol::Http, "http://h/", 1.23456),
                MeasurementRecord::error(Protocol::Http, "http://h/", "HTTP 503 Service Unavailable"),
                MeasurementRecord::error(Protocol::Http, "http://h/", "HTTP 503 Service Unavailable"),
            ],
        );

        let resp = handle_metrics(State(state_for(&path)), query(Some("http"), Some("1h")))
            .await
            .into_response();
        let (_, body) = body_json(resp).await;

        assert_eq!(body["observation"]["count"], 3);
        assert_eq!(body["observation"]["success_rate"], 0.333);
        assert_eq!(body["stats"]["avg"]["value"], 1.235);
    }

    #[tokio::test]
    async fn test_metrics_rejects_bad_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        write_log(&path, &[]);

        for (protocol, window) in [("smtp", "5m"), ("icmp", "5s"), ("icmp", "0m"), ("icmp", "m")] {
            let resp = handle_metrics(
                State(state_for(&path)),
                query(Some(protocol), Some(window)),
            )
            .await
            .into_response();
            let (status, body) = body_json(resp).await;

            assert_eq!(status, StatusCode::BAD_REQUEST, "{} {}", protocol, window);
            assert_eq!(body["status"], "error");
            assert!(!body["detail"].as_str().unwrap().is_empty());
            assert!(body["observation"].is_null());
        }
    }

    #[tokio::test]
    async fn test_metrics_malformed_query_string_uses_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        write_log(&path, &[]);

        let uri: axum::http::Uri = "http://localhost/metrics?protocol=icmp&protocol=tcp"
            .parse()
            .unwrap();
        let extracted = Query::<MetricsQuery>::try_from_uri(&uri);
        assert!(extracted.is_err());

        let resp = handle_metrics(State(state_for(&path)), extracted)
            .await
            .into_response();
        let (status, body) = body_json(resp).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["detail"].as_str().unwrap().contains("protocol"));
        assert!(body["observation"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.jsonl");

        let resp = handle_metrics(State(state_for(&path)), query(Some("tcp"), Some("5m")))
            .await
            .into_response();
        let (status, body) = body_json(resp).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body["detail"],
            "Resource related to latency measurement not found"
        );
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (status, body) = body_json(handle_health().await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["timezone"], "UTC");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.jsonl");
        let state = state_for(&path);
        state.metrics.record_enqueued(Protocol::Icmp);
        state.metrics.record_backpressure(Protocol::Icmp);

        let (status, body) = body_json(handle_status(State(state)).await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["log_path"], path.display().to_string());
        assert_eq!(body["pipeline"]["queues"]["icmp"]["backpressure_waits"], 1);
        assert!(body["schedulers"].as_object().unwrap().is_empty());
    }
}

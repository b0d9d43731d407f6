pub mod clickhouse;
pub mod cloudwatch;
pub mod elasticsearch;
pub mod injector;
pub mod loki;
pub mod prometheus;
pub mod tempo;
pub mod victorialogs;
pub mod victoriatraces;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::models::datasource::{DataSource, DsType};
use crate::models::log::LogEntry;
use crate::models::query::{QueryResult, Signal, TimeWindow, TraceSearchRequest};
use crate::models::trace::{Trace, TraceSummary};

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Cap on how much upstream body ends up in error messages.
const ERROR_BODY_PREFIX: usize = 512;

/// The uniform contract every backend family implements. Capabilities a
/// family does not have keep the erroring defaults; handler admission gates
/// on the datasource type before dispatch, so these are a second line of
/// defence.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        limit: i64,
    ) -> Result<QueryResult, ApiError>;

    async fn test_connection(&self) -> Result<(), ApiError>;

    async fn labels(&self) -> Result<Vec<String>, ApiError> {
        Err(unsupported("label discovery"))
    }

    async fn label_values(&self, _name: &str) -> Result<Vec<String>, ApiError> {
        Err(unsupported("label value discovery"))
    }

    /// Open a live tail and push entries into `tx` until the backend closes,
    /// an error occurs, or the receiver goes away.
    async fn stream(
        &self,
        _query: &str,
        _start: Option<i64>,
        _limit: i64,
        _tx: mpsc::Sender<LogEntry>,
    ) -> Result<(), ApiError> {
        Err(unsupported("live streaming"))
    }

    async fn get_trace(&self, _trace_id: &str) -> Result<Trace, ApiError> {
        Err(unsupported("trace lookup"))
    }

    async fn search_traces(&self, _req: &TraceSearchRequest) -> Result<Vec<TraceSummary>, ApiError> {
        Err(unsupported("trace search"))
    }

    async fn services(&self) -> Result<Vec<String>, ApiError> {
        Err(unsupported("service discovery"))
    }
}

fn unsupported(what: &str) -> ApiError {
    ApiError::invalid(format!("datasource type does not support {what}"))
}

/// Build the concrete adapter for a datasource record.
pub fn build_adapter(ds: &DataSource, http: &reqwest::Client) -> Box<dyn Adapter> {
    match ds.ds_type {
        DsType::Prometheus | DsType::VictoriaMetrics => {
            Box::new(prometheus::PrometheusAdapter::new(ds.clone(), http.clone()))
        }
        DsType::Loki => Box::new(loki::LokiAdapter::new(ds.clone(), http.clone())),
        DsType::VictoriaLogs => Box::new(victorialogs::VictoriaLogsAdapter::new(ds.clone(), http.clone())),
        DsType::Clickhouse => Box::new(clickhouse::ClickhouseAdapter::new(ds.clone(), http.clone())),
        DsType::Elasticsearch => {
            Box::new(elasticsearch::ElasticsearchAdapter::new(ds.clone(), http.clone()))
        }
        DsType::Tempo => Box::new(tempo::TempoAdapter::new(ds.clone(), http.clone())),
        DsType::VictoriaTraces => {
            Box::new(victoriatraces::VictoriaTracesAdapter::new(ds.clone(), http.clone()))
        }
        DsType::Cloudwatch => Box::new(cloudwatch::CloudwatchAdapter::new(ds.clone(), http.clone())),
    }
}

// ── Shared outbound discipline ──

/// Resolve `reference` against the datasource base URL, preserving any base
/// path prefix (reverse-proxied backends mount under a subpath).
pub(crate) fn resolve_endpoint(base: &str, reference: &str) -> Result<reqwest::Url, ApiError> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| ApiError::invalid(format!("datasource url is not a valid absolute url: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.join(reference.trim_start_matches('/'))
        .map_err(|e| ApiError::invalid(format!("cannot resolve endpoint {reference}: {e}")))
}

/// Inject datasource credentials, execute, and normalise failures:
/// upstream 401/403 become `AuthFailed`, other non-2xx become
/// `UpstreamError` carrying a trimmed body prefix.
pub(crate) async fn send(
    http: &reqwest::Client,
    ds: &DataSource,
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ApiError> {
    let request = injector::apply(builder, ds)?;
    let response = http.execute(request).await.map_err(ApiError::from_reqwest)?;
    check_status(response).await
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let trimmed: String = body.trim().chars().take(ERROR_BODY_PREFIX).collect();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(ApiError::AuthFailed(format!("upstream returned {}", status.as_u16())))
    } else {
        Err(ApiError::UpstreamError { status: status.as_u16(), body: trimmed })
    }
}

/// Walk candidate health endpoints in order. A 2xx ends the sweep with
/// success, an upstream auth failure aborts it immediately, and anything
/// else moves on; the last error is reported when every candidate failed.
pub(crate) async fn probe_candidates(
    http: &reqwest::Client,
    ds: &DataSource,
    candidates: &[&str],
) -> Result<(), ApiError> {
    let mut last_err: Option<ApiError> = None;
    for candidate in candidates {
        let url = resolve_endpoint(&ds.url, candidate)?;
        let builder = http.get(url).timeout(DISCOVERY_TIMEOUT);
        match send(http, ds, builder).await {
            Ok(_) => return Ok(()),
            Err(err @ ApiError::AuthFailed(_)) => return Err(err),
            Err(err) => {
                tracing::debug!("health candidate {candidate} failed: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ApiError::UpstreamError { status: 0, body: "no health endpoint candidates".into() }
    }))
}

pub(crate) fn require_query(query: &str) -> Result<&str, ApiError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        Err(ApiError::invalid("query must not be empty"))
    } else {
        Ok(trimmed)
    }
}

pub(crate) fn effective_limit(limit: i64, default: i64) -> i64 {
    if limit <= 0 { default } else { limit }
}

pub(crate) fn unsupported_signal(ds_type: DsType, got: Signal, allowed: &[Signal]) -> ApiError {
    let allowed: Vec<&str> = allowed.iter().map(Signal::as_str).collect();
    ApiError::invalid(format!(
        "signal {} is not supported by {} datasources (supported: {})",
        got.as_str(),
        ds_type.as_str(),
        allowed.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolution_preserves_base_prefix() {
        let url = resolve_endpoint("http://gw.example.com/loki-prod", "loki/api/v1/query_range").unwrap();
        assert_eq!(url.as_str(), "http://gw.example.com/loki-prod/loki/api/v1/query_range");
        let url = resolve_endpoint("http://prom:9090", "/api/v1/query_range").unwrap();
        assert_eq!(url.as_str(), "http://prom:9090/api/v1/query_range");
        let url = resolve_endpoint("http://es:9200/", "logs-*/_search").unwrap();
        assert_eq!(url.as_str(), "http://es:9200/logs-*/_search");
    }

    #[test]
    fn endpoint_resolution_rejects_relative_bases() {
        assert!(resolve_endpoint("loki:3100", "ready").is_err());
    }

    #[test]
    fn empty_queries_are_rejected() {
        assert!(require_query("").is_err());
        assert!(require_query("   ").is_err());
        assert_eq!(require_query(" up ").unwrap(), "up");
    }

    #[test]
    fn limits_default_when_non_positive() {
        assert_eq!(effective_limit(0, 1000), 1000);
        assert_eq!(effective_limit(-1, 1000), 1000);
        assert_eq!(effective_limit(50, 1000), 50);
    }
}

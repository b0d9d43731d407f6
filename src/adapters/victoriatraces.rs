use async_trait::async_trait;
use serde::Deserialize;

use super::tempo::{JaegerTrace, parse_trace_document, summarize_jaeger_trace};
use super::{Adapter, DISCOVERY_TIMEOUT, QUERY_TIMEOUT, resolve_endpoint, send};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::query::{QueryResult, Signal, TimeWindow, TraceSearchRequest};
use crate::models::trace::{Trace, TraceSummary, clamp_search_limit, normalize_search_results};

/// VictoriaTraces exposes the Jaeger HTTP API under two mount points
/// depending on version (`/select/jaeger/api/...` and `/api/...`). Requests
/// fall through the families in order; the first 2xx wins. The ordering is
/// empirical and not part of the API contract.
const ENDPOINT_FAMILIES: [&str; 2] = ["select/jaeger/", ""];

pub struct VictoriaTracesAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl VictoriaTracesAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }

    /// GET `{family}{path}` across the endpoint families, returning the
    /// first successful body. Upstream auth failures abort the sweep.
    async fn get_with_fallthrough(
        &self,
        path: &str,
        query: &[(String, String)],
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, ApiError> {
        let mut last_err: Option<ApiError> = None;
        for family in ENDPOINT_FAMILIES {
            let url = resolve_endpoint(&self.ds.url, &format!("{family}{path}"))?;
            let builder = self.http.get(url).timeout(timeout).query(query);
            match send(&self.http, &self.ds, builder).await {
                Ok(response) => {
                    return response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(ApiError::from_reqwest);
                }
                Err(err @ ApiError::AuthFailed(_)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ApiError::UpstreamError {
            status: 0,
            body: "no endpoint family answered".into(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct JaegerSearchResponse {
    #[serde(default)]
    data: Vec<JaegerTrace>,
}

#[derive(Debug, Deserialize)]
struct JaegerServicesResponse {
    #[serde(default)]
    data: Vec<String>,
}

#[async_trait]
impl Adapter for VictoriaTracesAdapter {
    async fn query(
        &self,
        _query: &str,
        _signal: Signal,
        _window: TimeWindow,
        _limit: i64,
    ) -> Result<QueryResult, ApiError> {
        Err(ApiError::invalid(
            "trace datasources are queried through the /traces endpoints",
        ))
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Trace, ApiError> {
        let trace_id = trace_id.trim();
        if trace_id.is_empty() {
            return Err(ApiError::invalid("trace id must not be empty"));
        }
        let bytes = self
            .get_with_fallthrough(&format!("api/traces/{trace_id}"), &[], QUERY_TIMEOUT)
            .await?;
        parse_trace_document(trace_id, &bytes)
    }

    async fn search_traces(&self, req: &TraceSearchRequest) -> Result<Vec<TraceSummary>, ApiError> {
        let limit = clamp_search_limit(req.limit);
        let mut query: Vec<(String, String)> = vec![("limit".into(), limit.to_string())];
        if let Some(service) = req.service.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            query.push(("service".into(), service.to_string()));
        }
        if let Some(operation) = req.operation.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
            query.push(("operation".into(), operation.to_string()));
        }
        if let Some(tags) = req.tags.as_deref().filter(|t| !t.is_empty()) {
            query.push(("tags".into(), tags.to_string()));
        }
        if let Some(min) = req.min_duration.as_deref().filter(|d| !d.is_empty()) {
            query.push(("minDuration".into(), min.to_string()));
        }
        if let Some(max) = req.max_duration.as_deref().filter(|d| !d.is_empty()) {
            query.push(("maxDuration".into(), max.to_string()));
        }
        // The Jaeger HTTP API takes microseconds.
        if let Some(start) = req.start {
            query.push(("start".into(), start.saturating_mul(1_000_000).to_string()));
        }
        if let Some(end) = req.end {
            query.push(("end".into(), end.saturating_mul(1_000_000).to_string()));
        }

        let bytes = self
            .get_with_fallthrough("api/traces", &query, QUERY_TIMEOUT)
            .await?;
        let parsed: JaegerSearchResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
        let summaries = parsed.data.into_iter().map(summarize_jaeger_trace).collect();
        Ok(normalize_search_results(summaries, limit))
    }

    async fn services(&self) -> Result<Vec<String>, ApiError> {
        let bytes = self
            .get_with_fallthrough("api/services", &[], DISCOVERY_TIMEOUT)
            .await?;
        let parsed: JaegerServicesResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
        let mut services = parsed.data;
        services.sort();
        services.dedup();
        Ok(services)
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        super::probe_candidates(
            &self.http,
            &self.ds,
            &["health", "select/jaeger/api/services", "api/services"],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaeger_search_body_summarises() {
        let body = serde_json::json!({
            "data": [{
                "traceID": "t9",
                "spans": [
                    {
                        "spanID": "a", "operationName": "GET /", "processID": "p1",
                        "startTime": 1_700_000_000_000_000_u64, "duration": 5_000,
                        "tags": [], "references": []
                    },
                    {
                        "spanID": "b", "operationName": "INSERT", "processID": "p2",
                        "startTime": 1_700_000_000_001_000_u64, "duration": 2_000,
                        "tags": [{"key": "error", "value": "true"}],
                        "references": [{"refType": "CHILD_OF", "spanID": "a"}]
                    }
                ],
                "processes": {"p1": {"serviceName": "api"}, "p2": {"serviceName": "db"}}
            }]
        });
        let parsed: JaegerSearchResponse = serde_json::from_slice(
            serde_json::to_vec(&body).unwrap().as_slice(),
        )
        .unwrap();
        let summaries: Vec<TraceSummary> =
            parsed.data.into_iter().map(summarize_jaeger_trace).collect();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.trace_id, "t9");
        assert_eq!(s.span_count, 2);
        assert_eq!(s.service_count, 2);
        assert_eq!(s.error_span_count, 1);
        assert_eq!(s.root_service_name, "api");
        assert_eq!(s.root_operation_name, "GET /");
    }
}

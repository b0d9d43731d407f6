use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{
    Adapter, QUERY_TIMEOUT, probe_candidates, require_query, resolve_endpoint, send,
    unsupported_signal,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::metrics::MetricSeries;
use crate::models::query::{QueryResult, Signal, TimeWindow};

/// Prometheus and VictoriaMetrics both speak the Prometheus HTTP query API;
/// the native `query_range` matrix is already the canonical metric shape.
pub struct PrometheusAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl PrometheusAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<RangeData>,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

pub(crate) fn parse_range_response(bytes: &[u8]) -> Result<Vec<MetricSeries>, ApiError> {
    let parsed: RangeResponse =
        serde_json::from_slice(bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
    if parsed.status != "success" {
        return Err(ApiError::UpstreamError {
            status: 200,
            body: parsed.error.unwrap_or_else(|| "query failed".to_string()),
        });
    }
    let data = parsed.data.unwrap_or(RangeData { result: Vec::new() });
    Ok(data
        .result
        .into_iter()
        .map(|s| MetricSeries { labels: s.metric, values: s.values })
        .collect())
}

#[async_trait]
impl Adapter for PrometheusAdapter {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        _limit: i64,
    ) -> Result<QueryResult, ApiError> {
        if signal != Signal::Metrics {
            return Err(unsupported_signal(self.ds.ds_type, signal, &[Signal::Metrics]));
        }
        let query = require_query(query)?;

        let url = resolve_endpoint(&self.ds.url, "api/v1/query_range")?;
        let builder = self
            .http
            .get(url)
            .timeout(QUERY_TIMEOUT)
            .query(&[
                ("query", query),
                ("start", &window.start.to_string()),
                ("end", &window.end.to_string()),
                ("step", &format!("{}s", window.step)),
            ]);
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        Ok(QueryResult::metrics(parse_range_response(&bytes)?))
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(
            &self.http,
            &self.ds,
            &["-/healthy", "api/v1/status/buildinfo", "api/v1/query?query=1"],
        )
        .await
    }
}

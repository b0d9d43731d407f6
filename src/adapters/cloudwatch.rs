use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Adapter, DISCOVERY_TIMEOUT, QUERY_TIMEOUT, effective_limit, require_query, send};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::log::LogEntry;
use crate::models::metrics::{MetricSeries, format_sample_value};
use crate::models::query::{QueryResult, Signal, TimeWindow};
use crate::timeparse;

const DEFAULT_LOGS_LIMIT: i64 = 1000;
const MAX_LOGS_LIMIT: i64 = 5000;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const METRICS_TARGET: &str = "GraniteServiceVersion20100801.GetMetricData";
const METRICS_PROBE_TARGET: &str = "GraniteServiceVersion20100801.ListMetrics";
const START_QUERY_TARGET: &str = "Logs_20140328.StartQuery";
const GET_RESULTS_TARGET: &str = "Logs_20140328.GetQueryResults";

/// CloudWatch speaks two signals: GetMetricData for metrics and the Logs
/// Insights StartQuery/GetQueryResults pair for logs, both over the SigV4-
/// signed JSON protocol.
pub struct CloudwatchAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

/// A metric query, accepted as JSON or as `Namespace:MetricName` shorthand.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct MetricQuerySpec {
    pub(crate) namespace: String,
    pub(crate) metric_name: String,
    #[serde(default)]
    pub(crate) dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) stat: Option<String>,
    #[serde(default)]
    pub(crate) period: Option<i64>,
}

pub(crate) fn parse_metric_query(query: &str) -> Result<MetricQuerySpec, ApiError> {
    let trimmed = query.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ApiError::invalid(format!("metric query is not valid JSON: {e}")));
    }
    match trimmed.split_once(':') {
        Some((namespace, metric)) if !namespace.is_empty() && !metric.is_empty() => {
            Ok(MetricQuerySpec {
                namespace: namespace.trim().to_string(),
                metric_name: metric.trim().to_string(),
                dimensions: BTreeMap::new(),
                stat: None,
                period: None,
            })
        }
        _ => Err(ApiError::invalid(
            "metric query must be JSON or Namespace:MetricName shorthand",
        )),
    }
}

/// CloudWatch periods must be multiples of 60 seconds.
pub(crate) fn clamp_period(period: i64) -> i64 {
    if period <= 60 {
        60
    } else {
        ((period + 59) / 60) * 60
    }
}

/// Logs queries may carry their own log groups as JSON; otherwise groups
/// come from the datasource config.
pub(crate) fn resolve_logs_query(query: &str, ds: &DataSource) -> Result<(String, Vec<String>), ApiError> {
    #[derive(Deserialize)]
    struct LogsQuerySpec {
        query: String,
        #[serde(default)]
        log_groups: Vec<String>,
    }

    let trimmed = query.trim();
    let (text, mut groups) = if trimmed.starts_with('{') {
        let spec: LogsQuerySpec = serde_json::from_str(trimmed)
            .map_err(|e| ApiError::invalid(format!("logs query is not valid JSON: {e}")))?;
        (spec.query, spec.log_groups)
    } else {
        (trimmed.to_string(), Vec::new())
    };

    if groups.is_empty() {
        if let Some(group) = ds.config_str("log_group") {
            groups.push(group.to_string());
        }
        if let Some(names) = ds.config.get("log_group_names").and_then(|v| v.as_array()) {
            groups.extend(names.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
    }
    if groups.is_empty() {
        return Err(ApiError::invalid(
            "logs queries need at least one log group (request or datasource config)",
        ));
    }
    Ok((text, groups))
}

impl CloudwatchAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }

    fn region(&self) -> Result<&str, ApiError> {
        self.ds
            .auth_config_str("region")
            .or_else(|| self.ds.config_str("region"))
            .ok_or_else(|| ApiError::invalid("cloudwatch datasources need a region"))
    }

    /// Per-service endpoint: AWS hosts are derived from the region; any
    /// other URL (LocalStack, a proxy) is used verbatim for both signals.
    fn endpoint(&self, service: &str) -> Result<String, ApiError> {
        let url = reqwest::Url::parse(&self.ds.url)
            .map_err(|e| ApiError::invalid(format!("datasource url is not a valid absolute url: {e}")))?;
        let aws_host = url.host_str().is_none_or(|h| h.ends_with(".amazonaws.com"));
        if aws_host {
            Ok(format!("https://{service}.{}.amazonaws.com/", self.region()?))
        } else {
            Ok(url.to_string())
        }
    }

    async fn call(
        &self,
        service: &str,
        target: &str,
        content_type: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<Vec<u8>, ApiError> {
        let builder = self
            .http
            .post(self.endpoint(service)?)
            .timeout(timeout)
            .header("X-Amz-Target", target)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body.to_string());
        let response = send(&self.http, &self.ds, builder).await?;
        response.bytes().await.map(|b| b.to_vec()).map_err(ApiError::from_reqwest)
    }

    async fn query_metrics(&self, query: &str, window: TimeWindow) -> Result<QueryResult, ApiError> {
        let spec = parse_metric_query(query)?;
        let period = clamp_period(spec.period.unwrap_or(window.step));
        let stat = spec.stat.clone().unwrap_or_else(|| "Average".to_string());

        let dimensions: Vec<serde_json::Value> = spec
            .dimensions
            .iter()
            .map(|(name, value)| serde_json::json!({"Name": name, "Value": value}))
            .collect();
        let body = serde_json::json!({
            "StartTime": window.start,
            "EndTime": window.end,
            "MetricDataQueries": [{
                "Id": "q0",
                "ReturnData": true,
                "MetricStat": {
                    "Metric": {
                        "Namespace": spec.namespace,
                        "MetricName": spec.metric_name,
                        "Dimensions": dimensions
                    },
                    "Period": period,
                    "Stat": stat
                }
            }]
        });
        let bytes = self
            .call("monitoring", METRICS_TARGET, "application/x-amz-json-1.0", body, QUERY_TIMEOUT)
            .await?;
        let parsed: GetMetricDataResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;

        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), spec.metric_name.clone());
        labels.insert("namespace".to_string(), spec.namespace.clone());
        labels.insert("stat".to_string(), stat);
        for (name, value) in &spec.dimensions {
            labels.insert(name.clone(), value.clone());
        }

        let mut series = Vec::new();
        for result in parsed.metric_data_results {
            let mut points: Vec<(f64, String)> = result
                .timestamps
                .iter()
                .zip(result.values.iter())
                .filter_map(|(ts, value)| {
                    timeparse::parse_flexible(ts)
                        .map(|dt| (dt.timestamp_millis() as f64 / 1000.0, format_sample_value(*value)))
                })
                .collect();
            points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            series.push(MetricSeries { labels: labels.clone(), values: points });
        }
        Ok(QueryResult::metrics(series))
    }

    async fn query_logs(
        &self,
        query: &str,
        window: TimeWindow,
        limit: i64,
    ) -> Result<QueryResult, ApiError> {
        let (text, groups) = resolve_logs_query(query, &self.ds)?;
        let limit = effective_limit(limit, DEFAULT_LOGS_LIMIT).min(MAX_LOGS_LIMIT);

        let body = serde_json::json!({
            "startTime": window.start,
            "endTime": window.end,
            "queryString": text,
            "logGroupNames": groups,
            "limit": limit
        });
        let bytes = self
            .call("logs", START_QUERY_TARGET, "application/x-amz-json-1.1", body, QUERY_TIMEOUT)
            .await?;
        let started: StartQueryResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;

        let results = tokio::time::timeout(QUERY_TIMEOUT, self.poll_results(&started.query_id))
            .await
            .map_err(|_| ApiError::Timeout("logs insights query did not complete".into()))??;
        Ok(QueryResult::logs(results))
    }

    async fn poll_results(&self, query_id: &str) -> Result<Vec<LogEntry>, ApiError> {
        loop {
            let bytes = self
                .call(
                    "logs",
                    GET_RESULTS_TARGET,
                    "application/x-amz-json-1.1",
                    serde_json::json!({"queryId": query_id}),
                    DISCOVERY_TIMEOUT,
                )
                .await?;
            let parsed: GetQueryResultsResponse =
                serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
            match parsed.status.as_str() {
                "Complete" => return Ok(results_to_entries(parsed.results)),
                "Scheduled" | "Running" | "Unknown" | "" => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => {
                    return Err(ApiError::UpstreamError {
                        status: 0,
                        body: format!("logs insights query ended with status {other}"),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetMetricDataResponse {
    #[serde(rename = "MetricDataResults", default)]
    metric_data_results: Vec<MetricDataResult>,
}

#[derive(Debug, Deserialize)]
struct MetricDataResult {
    #[serde(rename = "Timestamps", default)]
    timestamps: Vec<serde_json::Value>,
    #[serde(rename = "Values", default)]
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct StartQueryResponse {
    #[serde(rename = "queryId")]
    query_id: String,
}

#[derive(Debug, Deserialize)]
struct GetQueryResultsResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<Vec<ResultField>>,
}

#[derive(Debug, Deserialize)]
struct ResultField {
    #[serde(default)]
    field: String,
    #[serde(default)]
    value: String,
}

fn results_to_entries(results: Vec<Vec<ResultField>>) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for row in results {
        let mut timestamp = String::new();
        let mut line = String::new();
        let mut labels = BTreeMap::new();
        for field in row {
            match field.field.as_str() {
                "@timestamp" => {
                    timestamp = timeparse::parse_flexible_str(&field.value)
                        .map(timeparse::rfc3339_nanos)
                        .unwrap_or(field.value);
                }
                "@message" => line = field.value,
                "@ptr" => {}
                other => {
                    labels.insert(other.trim_start_matches('@').to_string(), field.value);
                }
            }
        }
        entries.push(LogEntry::new(timestamp, line, labels));
    }
    entries
}

#[async_trait]
impl Adapter for CloudwatchAdapter {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        limit: i64,
    ) -> Result<QueryResult, ApiError> {
        let query = require_query(query)?;
        match signal {
            Signal::Metrics => self.query_metrics(query, window).await,
            Signal::Logs => self.query_logs(query, window, limit).await,
            Signal::Traces => Err(super::unsupported_signal(
                self.ds.ds_type,
                signal,
                &[Signal::Metrics, Signal::Logs],
            )),
        }
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        // A signed ListMetrics probe; auth failures surface immediately.
        self.call(
            "monitoring",
            METRICS_PROBE_TARGET,
            "application/x-amz-json-1.0",
            serde_json::json!({}),
            DISCOVERY_TIMEOUT,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::datasource::{AuthType, DsType};

    fn ds(config: serde_json::Value) -> DataSource {
        DataSource {
            id: "d1".into(),
            organization_id: "o1".into(),
            name: "cw".into(),
            ds_type: DsType::Cloudwatch,
            url: "https://monitoring.eu-west-1.amazonaws.com".into(),
            auth_type: AuthType::Cloud,
            auth_config: serde_json::json!({
                "region": "eu-west-1",
                "access_key_id": "AK",
                "secret_access_key": "SK"
            })
            .as_object()
            .unwrap()
            .clone(),
            config: config.as_object().cloned().unwrap_or_default(),
            is_default: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn shorthand_metric_query() {
        let spec = parse_metric_query("AWS/EC2:CPUUtilization").unwrap();
        assert_eq!(spec.namespace, "AWS/EC2");
        assert_eq!(spec.metric_name, "CPUUtilization");
        assert!(spec.dimensions.is_empty());
    }

    #[test]
    fn json_metric_query() {
        let spec = parse_metric_query(
            r#"{"namespace":"AWS/Lambda","metric_name":"Errors","dimensions":{"FunctionName":"ingest"},"stat":"Sum","period":90}"#,
        )
        .unwrap();
        assert_eq!(spec.namespace, "AWS/Lambda");
        assert_eq!(spec.dimensions["FunctionName"], "ingest");
        assert_eq!(spec.stat.as_deref(), Some("Sum"));
    }

    #[test]
    fn bad_metric_query_is_invalid() {
        assert!(parse_metric_query("no-colon-here").is_err());
        assert!(parse_metric_query(":Metric").is_err());
    }

    #[test]
    fn period_clamps_to_minute_multiples() {
        assert_eq!(clamp_period(0), 60);
        assert_eq!(clamp_period(-5), 60);
        assert_eq!(clamp_period(60), 60);
        assert_eq!(clamp_period(61), 120);
        assert_eq!(clamp_period(90), 120);
        assert_eq!(clamp_period(300), 300);
    }

    #[test]
    fn log_groups_from_config() {
        let d = ds(serde_json::json!({"log_group": "/app/api"}));
        let (text, groups) = resolve_logs_query("fields @timestamp, @message", &d).unwrap();
        assert_eq!(text, "fields @timestamp, @message");
        assert_eq!(groups, vec!["/app/api"]);
    }

    #[test]
    fn log_groups_from_request_win() {
        let d = ds(serde_json::json!({"log_group": "/app/api"}));
        let (_, groups) = resolve_logs_query(
            r#"{"query":"fields @message","log_groups":["/g/one","/g/two"]}"#,
            &d,
        )
        .unwrap();
        assert_eq!(groups, vec!["/g/one", "/g/two"]);
    }

    #[test]
    fn missing_log_groups_fail() {
        let d = ds(serde_json::json!({}));
        assert!(resolve_logs_query("fields @message", &d).is_err());
    }

    #[test]
    fn insights_rows_become_entries() {
        let rows = vec![vec![
            ResultField { field: "@timestamp".into(), value: "2023-11-14 22:13:20.123".into() },
            ResultField { field: "@message".into(), value: "Error: boom".into() },
            ResultField { field: "@logStream".into(), value: "api-0".into() },
            ResultField { field: "@ptr".into(), value: "opaque".into() },
        ]];
        let entries = results_to_entries(rows);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, "2023-11-14T22:13:20.123Z");
        assert_eq!(entries[0].line, "Error: boom");
        assert_eq!(entries[0].level, "error");
        assert_eq!(entries[0].labels["logStream"], "api-0");
        assert!(!entries[0].labels.contains_key("ptr"));
    }

    #[test]
    fn non_aws_urls_are_used_verbatim() {
        let mut d = ds(serde_json::json!({}));
        d.url = "http://localstack:4566".into();
        let adapter = CloudwatchAdapter::new(d, reqwest::Client::new());
        assert_eq!(adapter.endpoint("logs").unwrap(), "http://localstack:4566/");
        let adapter2 = CloudwatchAdapter::new(ds(serde_json::json!({})), reqwest::Client::new());
        assert_eq!(adapter2.endpoint("logs").unwrap(), "https://logs.eu-west-1.amazonaws.com/");
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{
    Adapter, QUERY_TIMEOUT, probe_candidates, require_query, resolve_endpoint, send,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::log::LogEntry;
use crate::models::metrics::{MetricSeries, format_sample_value, series_signature};
use crate::models::query::{QueryResult, Signal, TimeWindow};
use crate::models::trace::{TraceSpan, normalize_service_name, tags_mark_error};
use crate::timeparse;

const TIMESTAMP_COLUMNS: [&str; 6] = ["timestamp", "time", "ts", "_time", "event_time", "log_time"];
const MESSAGE_COLUMNS: [&str; 5] = ["message", "msg", "log", "line", "body"];
const VALUE_COLUMNS: [&str; 3] = ["value", "metric_value", "v"];
const NAME_COLUMNS: [&str; 3] = ["metric_name", "__name__", "metric"];

type Row = serde_json::Map<String, serde_json::Value>;

/// ClickHouse over its HTTP interface: the caller writes raw SQL with
/// `{start}/{end}/{step}` placeholders and a mandatory `FORMAT JSON`; the
/// `signal` picks which column-heuristic normaliser interprets `data[]`.
pub struct ClickhouseAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl ClickhouseAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(default)]
    data: Vec<Row>,
}

pub(crate) fn substitute_window(query: &str, window: TimeWindow) -> String {
    query
        .replace("{start}", &window.start.to_string())
        .replace("{end}", &window.end.to_string())
        .replace("{step}", &window.step.to_string())
}

fn first_present<'a>(
    row: &'a Row,
    candidates: &[&'static str],
) -> Option<(&'static str, &'a serde_json::Value)> {
    candidates
        .iter()
        .find_map(|candidate| row.get(*candidate).map(|value| (*candidate, value)))
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ── Signal normalisers ──

pub(crate) fn rows_to_logs(rows: Vec<Row>) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for row in rows {
        let Some((ts_key, ts_value)) = first_present(&row, &TIMESTAMP_COLUMNS) else {
            continue;
        };
        let Some(timestamp) = timeparse::parse_flexible(ts_value).map(timeparse::rfc3339_nanos) else {
            continue;
        };
        let ts_key = ts_key.to_string();
        let msg_key = first_present(&row, &MESSAGE_COLUMNS).map(|(k, _)| k.to_string());
        let line = msg_key
            .as_deref()
            .and_then(|k| row.get(k))
            .map(scalar_to_string)
            .unwrap_or_default();

        let mut labels = BTreeMap::new();
        for (key, value) in &row {
            if *key == ts_key || Some(key.as_str()) == msg_key.as_deref() {
                continue;
            }
            labels.insert(key.clone(), scalar_to_string(value));
        }
        entries.push(LogEntry::new(timestamp, line, labels));
    }
    entries
}

pub(crate) fn rows_to_metrics(rows: Vec<Row>) -> Vec<MetricSeries> {
    let mut series: BTreeMap<String, MetricSeries> = BTreeMap::new();
    for row in rows {
        let Some((ts_key, ts_value)) = first_present(&row, &TIMESTAMP_COLUMNS) else {
            continue;
        };
        let Some(timestamp) = timeparse::parse_flexible(ts_value) else {
            continue;
        };
        let Some((value_key, raw_value)) = first_present(&row, &VALUE_COLUMNS) else {
            continue;
        };
        let value = match raw_value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        };
        let Some(value) = value else { continue };

        let ts_key = ts_key.to_string();
        let value_key = value_key.to_string();
        let name_key = first_present(&row, &NAME_COLUMNS).map(|(k, _)| k.to_string());

        let mut labels = BTreeMap::new();
        for (key, value) in &row {
            if *key == ts_key || *key == value_key || Some(key.as_str()) == name_key.as_deref() {
                continue;
            }
            labels.insert(key.clone(), scalar_to_string(value));
        }
        // The grouping key deliberately ignores the series name column so
        // one query shapes one family of series keyed by dimensions.
        let group = series_signature(&labels);
        if let Some(name) = name_key.as_deref().and_then(|k| row.get(k)) {
            labels.insert("__name__".to_string(), scalar_to_string(name));
        }
        series
            .entry(group)
            .or_insert_with(|| MetricSeries { labels, values: Vec::new() })
            .values
            .push((timestamp.timestamp_millis() as f64 / 1000.0, format_sample_value(value)));
    }
    series
        .into_values()
        .map(|mut s| {
            s.values
                .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            s
        })
        .collect()
}

pub(crate) fn rows_to_spans(rows: Vec<Row>) -> Vec<TraceSpan> {
    let mut spans = Vec::new();
    for row in rows {
        let span_id = row.get("span_id").map(scalar_to_string).unwrap_or_default();
        if span_id.is_empty() {
            continue;
        }
        let parent = row
            .get("parent_span_id")
            .map(scalar_to_string)
            .filter(|p| !p.is_empty());
        let tags: BTreeMap<String, serde_json::Value> = match row.get("attributes") {
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            Some(serde_json::Value::String(s)) => serde_json::from_str::<
                serde_json::Map<String, serde_json::Value>,
            >(s)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default(),
            _ => BTreeMap::new(),
        };
        let status_code = row.get("status_code").map(scalar_to_string).unwrap_or_default();
        let status = if status_code.eq_ignore_ascii_case("error")
            || status_code == "2"
            || tags_mark_error(&tags)
        {
            "error".to_string()
        } else {
            String::new()
        };
        spans.push(TraceSpan {
            span_id,
            parent_span_id: parent,
            service_name: normalize_service_name(
                &row.get("service_name").map(scalar_to_string).unwrap_or_default(),
            ),
            operation_name: row.get("operation_name").map(scalar_to_string).unwrap_or_default(),
            start_time_unix_nano: row
                .get("start_time_unix_nano")
                .and_then(parse_u64)
                .unwrap_or_default(),
            duration_nano: row.get("duration_ns").and_then(parse_u64).unwrap_or_default(),
            tags,
            logs: Vec::new(),
            status,
        });
    }
    spans
}

fn parse_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Adapter for ClickhouseAdapter {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        _limit: i64,
    ) -> Result<QueryResult, ApiError> {
        let query = require_query(query)?;
        if !query.to_ascii_uppercase().contains("FORMAT JSON") {
            return Err(ApiError::invalid("clickhouse queries must include FORMAT JSON"));
        }
        let sql = substitute_window(query, window);

        let mut url = resolve_endpoint(&self.ds.url, "")?;
        if let Some(database) = self.ds.config_str("database") {
            url.query_pairs_mut().append_pair("database", database);
        }
        let builder = self
            .http
            .post(url)
            .timeout(QUERY_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(sql);
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        let parsed: HttpResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;

        match signal {
            Signal::Metrics => Ok(QueryResult::metrics(rows_to_metrics(parsed.data))),
            Signal::Logs => Ok(QueryResult::logs(rows_to_logs(parsed.data))),
            Signal::Traces => Ok(QueryResult::traces(rows_to_spans(parsed.data))),
        }
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(&self.http, &self.ds, &["ping", ""]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(json: serde_json::Value) -> Row {
        json.as_object().unwrap().clone()
    }

    #[test]
    fn placeholder_substitution() {
        let window = TimeWindow::new(1_700_000_000, 1_700_000_300, 60).unwrap();
        let sql = substitute_window(
            "SELECT t, v FROM m WHERE t >= {start} AND t <= {end} GROUP BY intDiv(t, {step}) FORMAT JSON",
            window,
        );
        assert!(sql.contains("t >= 1700000000"));
        assert!(sql.contains("t <= 1700000300"));
        assert!(sql.contains("intDiv(t, 60)"));
    }

    #[test]
    fn metric_rows_group_into_series() {
        let rows = vec![
            row(serde_json::json!({"timestamp": 1_700_000_000, "value": 2.5, "host": "a", "metric_name": "cpu"})),
            row(serde_json::json!({"timestamp": 1_700_000_060, "value": 2.8, "host": "a", "metric_name": "cpu"})),
            row(serde_json::json!({"timestamp": 1_700_000_000, "value": 3.1, "host": "b", "metric_name": "cpu"})),
        ];
        let series = rows_to_metrics(rows);
        assert_eq!(series.len(), 2);
        let a = series.iter().find(|s| s.labels["host"] == "a").unwrap();
        assert_eq!(a.values.len(), 2);
        assert!(a.values[0].0 < a.values[1].0);
        assert_eq!(a.values[0].1, "2.5");
        assert!(series.iter().all(|s| s.labels["__name__"] == "cpu"));
    }

    #[test]
    fn log_rows_detect_columns_and_level() {
        let rows = vec![
            row(serde_json::json!({
                "event_time": "2023-11-14 22:13:20",
                "message": "connection reset",
                "severity": "ERROR",
                "service": "api"
            })),
            row(serde_json::json!({"no_timestamp": true, "message": "dropped"})),
        ];
        let entries = rows_to_logs(rows);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, "2023-11-14T22:13:20Z");
        assert_eq!(entries[0].line, "connection reset");
        assert_eq!(entries[0].level, "error");
        assert_eq!(entries[0].labels["service"], "api");
        assert!(!entries[0].labels.contains_key("message"));
    }

    #[test]
    fn trace_rows_map_to_spans() {
        let rows = vec![
            row(serde_json::json!({
                "span_id": "s1",
                "parent_span_id": "",
                "operation_name": "GET /",
                "service_name": " api ",
                "start_time_unix_nano": "1700000000000000000",
                "duration_ns": 2_000_000,
                "status_code": "2",
                "attributes": {"http.method": "GET"}
            })),
            row(serde_json::json!({
                "span_id": "s2",
                "parent_span_id": "s1",
                "operation_name": "SELECT",
                "service_name": "",
                "start_time_unix_nano": 1_700_000_000_100_000_000_u64,
                "duration_ns": 1_000_000,
                "status_code": "0",
                "attributes": "{\"db.system\":\"postgres\"}"
            })),
        ];
        let spans = rows_to_spans(rows);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].service_name, "api");
        assert_eq!(spans[0].status, "error");
        assert_eq!(spans[0].parent_span_id, None);
        assert_eq!(spans[1].service_name, "unknown");
        assert_eq!(spans[1].status, "");
        assert_eq!(spans[1].tags["db.system"], "postgres");
    }
}

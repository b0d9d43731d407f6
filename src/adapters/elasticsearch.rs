use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{
    Adapter, QUERY_TIMEOUT, effective_limit, probe_candidates, require_query, resolve_endpoint,
    send, unsupported_signal,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::log::LogEntry;
use crate::models::metrics::{MetricSeries, SeriesBuilder};
use crate::models::query::{QueryResult, Signal, TimeWindow};
use crate::timeparse;

const DEFAULT_LIMIT: i64 = 1000;
const DEFAULT_TIMESTAMP_FIELD: &str = "@timestamp";
const MESSAGE_FIELDS: [&str; 5] = ["message", "msg", "log", "line", "body"];

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Elasticsearch `_search` with time-range injection and, for metrics, an
/// auto-injected `date_histogram` aggregation walked recursively.
pub struct ElasticsearchAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl ElasticsearchAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }

    fn timestamp_field(&self) -> String {
        self.ds
            .config_str("timestamp_field")
            .unwrap_or(DEFAULT_TIMESTAMP_FIELD)
            .to_string()
    }

    fn index(&self) -> String {
        self.ds.config_str("index").unwrap_or("_all").to_string()
    }
}

/// `{start}`-style placeholder interpolation on the raw query string.
pub(crate) fn interpolate(query: &str, window: TimeWindow) -> String {
    query
        .replace("{start_ms}", &window.start_millis().to_string())
        .replace("{end_ms}", &window.end_millis().to_string())
        .replace("{start_ns}", &window.start_nanos().to_string())
        .replace("{end_ns}", &window.end_nanos().to_string())
        .replace("{start_rfc3339}", &timeparse::epoch_to_rfc3339(window.start))
        .replace("{end_rfc3339}", &timeparse::epoch_to_rfc3339(window.end))
        .replace("{start}", &window.start.to_string())
        .replace("{end}", &window.end.to_string())
        .replace("{step}", &window.step.to_string())
}

/// Derive a `fixed_interval` from the step, preferring whole hours/minutes.
pub(crate) fn fixed_interval(step_secs: i64) -> String {
    if step_secs % 3600 == 0 {
        format!("{}h", step_secs / 3600)
    } else if step_secs % 60 == 0 {
        format!("{}m", step_secs / 60)
    } else {
        format!("{step_secs}s")
    }
}

/// Whether the request already filters on a range over `field` somewhere.
pub(crate) fn has_range_on(value: &serde_json::Value, field: &str) -> bool {
    match value {
        serde_json::Value::Object(map) => map.iter().any(|(key, inner)| {
            (key == "range"
                && inner
                    .as_object()
                    .is_some_and(|range| range.contains_key(field)))
                || has_range_on(inner, field)
        }),
        serde_json::Value::Array(items) => items.iter().any(|item| has_range_on(item, field)),
        _ => false,
    }
}

/// Build the `_search` body: raw JSON requests pass through, anything else
/// becomes a `query_string` shortcut; the time range lands in a bool filter
/// unless the caller already ranges over the timestamp field.
pub(crate) fn build_search_body(
    query: &str,
    signal: Signal,
    window: TimeWindow,
    limit: i64,
    timestamp_field: &str,
) -> Result<JsonMap, ApiError> {
    let interpolated = interpolate(query, window);
    let trimmed = interpolated.trim();

    let mut body: JsonMap = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)
            .map_err(|e| ApiError::invalid(format!("query is not valid search JSON: {e}")))?
    } else {
        let mut map = JsonMap::new();
        map.insert(
            "query".to_string(),
            serde_json::json!({"query_string": {"query": trimmed}}),
        );
        map
    };

    if !has_range_on(&serde_json::Value::Object(body.clone()), timestamp_field) {
        let range = serde_json::json!({
            "range": {
                timestamp_field: {
                    "gte": window.start_millis(),
                    "lte": window.end_millis(),
                    "format": "epoch_millis"
                }
            }
        });
        let original = body.remove("query");
        let mut bool_body = JsonMap::new();
        if let Some(original) = original {
            bool_body.insert("must".to_string(), serde_json::Value::Array(vec![original]));
        }
        bool_body.insert("filter".to_string(), serde_json::Value::Array(vec![range]));
        body.insert("query".to_string(), serde_json::json!({"bool": bool_body}));
    }

    match signal {
        Signal::Metrics => {
            body.entry("aggs".to_string()).or_insert_with(|| {
                serde_json::json!({
                    "timeseries": {
                        "date_histogram": {
                            "field": timestamp_field,
                            "fixed_interval": fixed_interval(window.step)
                        }
                    }
                })
            });
            body.insert("size".to_string(), serde_json::json!(0));
        }
        Signal::Logs => {
            body.entry("size".to_string()).or_insert_with(|| serde_json::json!(limit));
            body.entry("sort".to_string()).or_insert_with(|| {
                serde_json::json!([{timestamp_field: {"order": "desc"}}])
            });
        }
        Signal::Traces => unreachable!("gated before body construction"),
    }
    Ok(body)
}

// ── Response parsing ──

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: SearchHits,
    #[serde(default)]
    aggregations: JsonMap,
}

#[derive(Debug, Default, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_index", default)]
    index: String,
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_source", default)]
    source: JsonMap,
    #[serde(default)]
    fields: JsonMap,
}

fn flatten_into(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, serde_json::Value>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten_into(&path, inner, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn hits_to_logs(response: &SearchResponse, timestamp_field: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for hit in &response.hits.hits {
        let mut document: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        flatten_into("", &serde_json::Value::Object(hit.source.clone()), &mut document);
        for (key, value) in &hit.fields {
            // ES `fields` values are always arrays; unwrap singletons.
            let unwrapped = match value {
                serde_json::Value::Array(items) if items.len() == 1 => items[0].clone(),
                other => other.clone(),
            };
            document.entry(key.clone()).or_insert(unwrapped);
        }

        let ts_candidates = [timestamp_field, "@timestamp", "timestamp", "time", "ts"];
        let ts_key = ts_candidates.iter().find(|c| document.contains_key(**c));
        let timestamp = ts_key
            .and_then(|k| document.get(*k))
            .and_then(timeparse::parse_flexible)
            .map(timeparse::rfc3339_nanos)
            .unwrap_or_default();

        let message_key = MESSAGE_FIELDS.iter().find(|c| document.contains_key(**c)).copied();
        let line = match message_key.and_then(|k| document.get(k)) {
            Some(v) => scalar_to_string(v),
            // Any syntactically valid JSON rendering of the document; key
            // order is not part of the contract.
            None => serde_json::to_string(&document).unwrap_or_default(),
        };

        let mut labels = BTreeMap::new();
        labels.insert("_index".to_string(), hit.index.clone());
        labels.insert("_id".to_string(), hit.id.clone());
        for (key, value) in &document {
            if Some(key.as_str()) == ts_key.copied() || Some(key.as_str()) == message_key {
                continue;
            }
            if value.is_object() || value.is_array() {
                continue;
            }
            labels.insert(key.clone(), scalar_to_string(value));
        }
        entries.push(LogEntry::new(timestamp, line, labels));
    }
    // Newest first, matching the requested sort even when the backend
    // ignores it.
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

/// Walk aggregation trees: terms-like buckets contribute labels, time
/// buckets contribute points. A numeric leaf (`{"value": n}`) under a time
/// bucket becomes a point per leaf name; otherwise `doc_count` is the value.
pub(crate) fn aggregations_to_series(aggregations: &JsonMap) -> Vec<MetricSeries> {
    let mut builder = SeriesBuilder::new();
    walk_aggs(aggregations, &BTreeMap::new(), &mut builder);
    builder.finish()
}

fn walk_aggs(aggs: &JsonMap, labels: &BTreeMap<String, String>, builder: &mut SeriesBuilder) {
    for (name, node) in aggs {
        let Some(buckets) = node.get("buckets").and_then(|b| b.as_array()) else {
            continue;
        };
        for bucket in buckets {
            let Some(bucket) = bucket.as_object() else { continue };
            if let Some(ts) = bucket_timestamp(bucket) {
                emit_time_bucket(name, bucket, ts, labels, builder);
            } else if let Some(key) = bucket.get("key") {
                let mut inner = labels.clone();
                inner.insert(name.clone(), scalar_to_string(key));
                walk_aggs(&sub_aggs(bucket), &inner, builder);
            }
        }
    }
}

fn emit_time_bucket(
    agg_name: &str,
    bucket: &JsonMap,
    ts: f64,
    labels: &BTreeMap<String, String>,
    builder: &mut SeriesBuilder,
) {
    let mut emitted_leaf = false;
    for (leaf_name, leaf) in &sub_aggs(bucket) {
        if let Some(value) = leaf.get("value").and_then(|v| v.as_f64()) {
            push_point(builder, labels, leaf_name, ts, value);
            emitted_leaf = true;
        }
    }
    if !emitted_leaf {
        let count = bucket.get("doc_count").and_then(|v| v.as_f64()).unwrap_or(0.0);
        push_point(builder, labels, agg_name, ts, count);
    }
}

fn push_point(
    builder: &mut SeriesBuilder,
    labels: &BTreeMap<String, String>,
    name: &str,
    ts: f64,
    value: f64,
) {
    let mut full = labels.clone();
    full.insert("__name__".to_string(), name.to_string());
    builder.push(full, ts, value);
}

/// Sub-aggregations of a bucket: every object member that isn't bucket
/// bookkeeping.
fn sub_aggs(bucket: &JsonMap) -> JsonMap {
    bucket
        .iter()
        .filter(|(key, value)| {
            !matches!(key.as_str(), "key" | "key_as_string" | "doc_count") && value.is_object()
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// A bucket is a time bucket when its key (or key_as_string) parses as a
/// timestamp of millisecond-or-finer magnitude.
fn bucket_timestamp(bucket: &JsonMap) -> Option<f64> {
    if let Some(s) = bucket.get("key_as_string").and_then(|v| v.as_str()) {
        if let Some(dt) = timeparse::parse_flexible_str(s) {
            return Some(dt.timestamp_millis() as f64 / 1000.0);
        }
    }
    let key = bucket.get("key")?.as_i64()?;
    if key.abs() >= 100_000_000_000 {
        Some(key as f64 / 1000.0)
    } else {
        None
    }
}

#[async_trait]
impl Adapter for ElasticsearchAdapter {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        limit: i64,
    ) -> Result<QueryResult, ApiError> {
        if signal == Signal::Traces {
            return Err(unsupported_signal(
                self.ds.ds_type,
                signal,
                &[Signal::Logs, Signal::Metrics],
            ));
        }
        let query = require_query(query)?;
        let limit = effective_limit(limit, DEFAULT_LIMIT);
        let timestamp_field = self.timestamp_field();
        let body = build_search_body(query, signal, window, limit, &timestamp_field)?;

        let url = resolve_endpoint(&self.ds.url, &format!("{}/_search", self.index()))?;
        let builder = self
            .http
            .post(url)
            .timeout(QUERY_TIMEOUT)
            .json(&serde_json::Value::Object(body));
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        let parsed: SearchResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;

        match signal {
            Signal::Metrics => Ok(QueryResult::metrics(aggregations_to_series(&parsed.aggregations))),
            Signal::Logs => Ok(QueryResult::logs(hits_to_logs(&parsed, &timestamp_field))),
            Signal::Traces => unreachable!(),
        }
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(&self.http, &self.ds, &["_cluster/health", ""]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> TimeWindow {
        TimeWindow::new(1_700_000_000, 1_700_003_600, 60).unwrap()
    }

    #[test]
    fn interpolation_covers_every_unit() {
        let out = interpolate("{start} {end} {step} {start_ms} {end_ns} {start_rfc3339}", window());
        assert_eq!(
            out,
            "1700000000 1700003600 60 1700000000000 1700003600000000000 2023-11-14T22:13:20Z"
        );
    }

    #[test]
    fn shortcut_becomes_query_string_with_range_filter() {
        let body = build_search_body("status:500", Signal::Logs, window(), 100, "@timestamp").unwrap();
        let value = serde_json::Value::Object(body);
        assert_eq!(
            value["query"]["bool"]["must"][0]["query_string"]["query"],
            "status:500"
        );
        let range = &value["query"]["bool"]["filter"][0]["range"]["@timestamp"];
        assert_eq!(range["gte"], 1_700_000_000_000_i64);
        assert_eq!(range["lte"], 1_700_003_600_000_i64);
        assert_eq!(value["size"], 100);
    }

    #[test]
    fn existing_range_is_not_doubled() {
        let raw = r#"{"query":{"bool":{"filter":[{"range":{"@timestamp":{"gte":1}}}]}}}"#;
        let body = build_search_body(raw, Signal::Logs, window(), 100, "@timestamp").unwrap();
        let value = serde_json::Value::Object(body);
        // Still the caller's single filter, not wrapped again.
        assert_eq!(value["query"]["bool"]["filter"][0]["range"]["@timestamp"]["gte"], 1);
    }

    #[test]
    fn metrics_inject_date_histogram() {
        let body = build_search_body("*", Signal::Metrics, window(), 0, "@timestamp").unwrap();
        let value = serde_json::Value::Object(body);
        assert_eq!(value["size"], 0);
        assert_eq!(
            value["aggs"]["timeseries"]["date_histogram"]["fixed_interval"],
            "1m"
        );
    }

    #[test]
    fn interval_units() {
        assert_eq!(fixed_interval(30), "30s");
        assert_eq!(fixed_interval(120), "2m");
        assert_eq!(fixed_interval(7200), "2h");
    }

    #[test]
    fn hits_flatten_and_detect_fields() {
        let response: SearchResponse = serde_json::from_value(serde_json::json!({
            "hits": {"hits": [
                {
                    "_index": "logs-2023.11", "_id": "doc1",
                    "_source": {
                        "@timestamp": "2023-11-14T22:13:20Z",
                        "message": "upstream timeout",
                        "level": "error",
                        "kubernetes": {"pod": "api-0"}
                    }
                },
                {
                    "_index": "logs-2023.11", "_id": "doc2",
                    "_source": {"@timestamp": "2023-11-14T22:15:00Z", "status": 200}
                }
            ]}
        }))
        .unwrap();
        let entries = hits_to_logs(&response, "@timestamp");
        assert_eq!(entries.len(), 2);
        // Sorted newest first.
        assert_eq!(entries[0].labels["_id"], "doc2");
        // No message field: the line is a JSON rendering of the document.
        assert!(entries[0].line.contains("\"status\""));
        assert_eq!(entries[1].line, "upstream timeout");
        assert_eq!(entries[1].level, "error");
        assert_eq!(entries[1].labels["kubernetes.pod"], "api-0");
        assert_eq!(entries[1].labels["_index"], "logs-2023.11");
        assert!(!entries[1].labels.contains_key("message"));
    }

    #[test]
    fn aggregation_walk_emits_labelled_series() {
        let aggs: JsonMap = serde_json::from_value(serde_json::json!({
            "by_service": {
                "buckets": [
                    {
                        "key": "api",
                        "doc_count": 10,
                        "over_time": {
                            "buckets": [
                                {"key": 1_700_000_000_000_i64, "doc_count": 4},
                                {"key": 1_700_000_060_000_i64, "doc_count": 6}
                            ]
                        }
                    },
                    {
                        "key": "worker",
                        "doc_count": 3,
                        "over_time": {
                            "buckets": [
                                {"key": 1_700_000_000_000_i64, "doc_count": 3,
                                 "p95": {"value": 1.5}}
                            ]
                        }
                    }
                ]
            }
        }))
        .unwrap();
        let series = aggregations_to_series(&aggs);
        assert_eq!(series.len(), 2);
        let api = series.iter().find(|s| s.labels.get("by_service").map(String::as_str) == Some("api")).unwrap();
        assert_eq!(api.labels["__name__"], "over_time");
        assert_eq!(api.values.len(), 2);
        assert_eq!(api.values[0], (1_700_000_000.0, "4".to_string()));
        let worker = series.iter().find(|s| s.labels.get("by_service").map(String::as_str) == Some("worker")).unwrap();
        assert_eq!(worker.labels["__name__"], "p95");
        assert_eq!(worker.values[0].1, "1.5");
    }

    #[test]
    fn top_level_date_histogram() {
        let aggs: JsonMap = serde_json::from_value(serde_json::json!({
            "timeseries": {"buckets": [
                {"key": 1_700_000_000_000_i64, "key_as_string": "2023-11-14T22:13:20.000Z", "doc_count": 7}
            ]}
        }))
        .unwrap();
        let series = aggregations_to_series(&aggs);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels["__name__"], "timeseries");
        assert_eq!(series[0].values[0], (1_700_000_000.0, "7".to_string()));
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use super::{
    Adapter, DISCOVERY_TIMEOUT, QUERY_TIMEOUT, probe_candidates, resolve_endpoint, send,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::query::{QueryResult, Signal, TimeWindow, TraceSearchRequest};
use crate::models::trace::{
    SpanLog, Trace, TraceSpan, TraceSummary, assemble_trace, clamp_search_limit,
    normalize_search_results, normalize_service_name, tags_mark_error,
};

/// Tempo serves traces in either the Jaeger `data[]` envelope or the OTLP
/// `batches[]` envelope depending on version and endpoint; both funnel into
/// the canonical span model here.
pub struct TempoAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl TempoAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }
}

// ── Wire shapes ──

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TraceDocument {
    Jaeger(JaegerDocument),
    Otlp(OtlpDocument),
}

#[derive(Debug, Deserialize)]
struct JaegerDocument {
    data: Vec<JaegerTrace>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JaegerTrace {
    #[serde(rename = "traceID", default)]
    pub(crate) trace_id: String,
    #[serde(default)]
    spans: Vec<JaegerSpan>,
    #[serde(default)]
    processes: HashMap<String, JaegerProcess>,
}

#[derive(Debug, Deserialize)]
struct JaegerProcess {
    #[serde(rename = "serviceName", default)]
    service_name: String,
}

#[derive(Debug, Deserialize)]
struct JaegerSpan {
    #[serde(rename = "spanID", default)]
    span_id: String,
    #[serde(rename = "operationName", default)]
    operation_name: String,
    #[serde(rename = "processID", default)]
    process_id: String,
    #[serde(default)]
    references: Vec<JaegerReference>,
    /// Microseconds since epoch.
    #[serde(rename = "startTime", default)]
    start_time_us: u64,
    /// Microseconds.
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    tags: Vec<JaegerKeyValue>,
    #[serde(default)]
    logs: Vec<JaegerLog>,
}

#[derive(Debug, Deserialize)]
struct JaegerReference {
    #[serde(rename = "refType", default)]
    ref_type: String,
    #[serde(rename = "spanID", default)]
    span_id: String,
}

#[derive(Debug, Deserialize)]
struct JaegerKeyValue {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JaegerLog {
    /// Microseconds since epoch.
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    fields: Vec<JaegerKeyValue>,
}

#[derive(Debug, Deserialize)]
struct OtlpDocument {
    batches: Vec<OtlpBatch>,
}

#[derive(Debug, Deserialize)]
struct OtlpBatch {
    #[serde(default)]
    resource: Option<OtlpResource>,
    #[serde(rename = "scopeSpans", alias = "instrumentationLibrarySpans", default)]
    scope_spans: Vec<OtlpScopeSpans>,
}

#[derive(Debug, Default, Deserialize)]
struct OtlpResource {
    #[serde(default)]
    attributes: Vec<OtlpKeyValue>,
}

#[derive(Debug, Deserialize)]
struct OtlpScopeSpans {
    #[serde(default)]
    spans: Vec<OtlpSpan>,
}

#[derive(Debug, Deserialize)]
struct OtlpSpan {
    #[serde(rename = "spanId", default)]
    span_id: String,
    #[serde(rename = "parentSpanId", default)]
    parent_span_id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "startTimeUnixNano", default)]
    start_time_unix_nano: serde_json::Value,
    #[serde(rename = "endTimeUnixNano", default)]
    end_time_unix_nano: serde_json::Value,
    #[serde(default)]
    attributes: Vec<OtlpKeyValue>,
    #[serde(default)]
    status: Option<OtlpStatus>,
}

#[derive(Debug, Deserialize)]
struct OtlpStatus {
    #[serde(default)]
    code: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OtlpKeyValue {
    key: String,
    #[serde(default)]
    value: OtlpAnyValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtlpAnyValue {
    #[serde(default)]
    string_value: Option<String>,
    #[serde(default)]
    int_value: Option<serde_json::Value>,
    #[serde(default)]
    double_value: Option<f64>,
    #[serde(default)]
    bool_value: Option<bool>,
}

impl OtlpAnyValue {
    fn into_json(self) -> serde_json::Value {
        if let Some(s) = self.string_value {
            serde_json::Value::String(s)
        } else if let Some(i) = self.int_value {
            // OTLP JSON encodes 64-bit ints as strings.
            match i {
                serde_json::Value::String(s) => s
                    .parse::<i64>()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::String(s)),
                other => other,
            }
        } else if let Some(d) = self.double_value {
            serde_json::Value::from(d)
        } else if let Some(b) = self.bool_value {
            serde_json::Value::Bool(b)
        } else {
            serde_json::Value::Null
        }
    }
}

/// OTLP JSON encodes nanosecond timestamps as either strings or numbers.
fn value_to_u64(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

// ── Flattening into canonical spans ──

fn jaeger_spans(trace: JaegerTrace) -> Vec<TraceSpan> {
    let processes = trace.processes;
    trace
        .spans
        .into_iter()
        .map(|span| {
            let service = processes
                .get(&span.process_id)
                .map(|p| p.service_name.as_str())
                .unwrap_or("");
            let parent = span
                .references
                .iter()
                .find(|r| r.ref_type.eq_ignore_ascii_case("CHILD_OF"))
                .map(|r| r.span_id.clone())
                .filter(|p| !p.is_empty());
            let tags: BTreeMap<String, serde_json::Value> =
                span.tags.into_iter().map(|kv| (kv.key, kv.value)).collect();
            let status = if tags_mark_error(&tags) { "error".to_string() } else { String::new() };
            TraceSpan {
                span_id: span.span_id,
                parent_span_id: parent,
                service_name: normalize_service_name(service),
                operation_name: span.operation_name,
                start_time_unix_nano: span.start_time_us.saturating_mul(1_000),
                duration_nano: span.duration.saturating_mul(1_000),
                tags,
                logs: span
                    .logs
                    .into_iter()
                    .map(|log| SpanLog {
                        timestamp_unix_nano: log.timestamp.saturating_mul(1_000),
                        fields: log.fields.into_iter().map(|kv| (kv.key, kv.value)).collect(),
                    })
                    .collect(),
                status,
            }
        })
        .collect()
}

fn otlp_spans(document: OtlpDocument) -> Vec<TraceSpan> {
    let mut spans = Vec::new();
    for batch in document.batches {
        let service = batch
            .resource
            .unwrap_or_default()
            .attributes
            .into_iter()
            .find(|kv| kv.key == "service.name")
            .map(|kv| match kv.value.into_json() {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();
        for scope in batch.scope_spans {
            for span in scope.spans {
                let start = value_to_u64(&span.start_time_unix_nano);
                let end = value_to_u64(&span.end_time_unix_nano);
                let tags: BTreeMap<String, serde_json::Value> = span
                    .attributes
                    .into_iter()
                    .map(|kv| (kv.key, kv.value.into_json()))
                    .collect();
                let status_error = span.status.as_ref().is_some_and(|s| match &s.code {
                    serde_json::Value::Number(n) => n.as_i64() == Some(2),
                    serde_json::Value::String(s) => {
                        s == "STATUS_CODE_ERROR" || s.eq_ignore_ascii_case("error") || s == "2"
                    }
                    _ => false,
                });
                let status = if status_error || tags_mark_error(&tags) {
                    "error".to_string()
                } else {
                    String::new()
                };
                spans.push(TraceSpan {
                    span_id: span.span_id,
                    parent_span_id: Some(span.parent_span_id).filter(|p| !p.is_empty()),
                    service_name: normalize_service_name(&service),
                    operation_name: span.name,
                    start_time_unix_nano: start,
                    duration_nano: end.saturating_sub(start),
                    tags,
                    logs: Vec::new(),
                    status,
                });
            }
        }
    }
    spans
}

/// Parse a trace fetch body in either envelope.
pub(crate) fn parse_trace_document(trace_id: &str, bytes: &[u8]) -> Result<Trace, ApiError> {
    let document: TraceDocument =
        serde_json::from_slice(bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
    let spans = match document {
        TraceDocument::Jaeger(doc) => {
            let Some(trace) = doc.data.into_iter().next() else {
                return Err(ApiError::not_found("trace"));
            };
            jaeger_spans(trace)
        }
        TraceDocument::Otlp(doc) => otlp_spans(doc),
    };
    if spans.is_empty() {
        return Err(ApiError::not_found("trace"));
    }
    Ok(assemble_trace(trace_id, spans))
}

pub(crate) fn summarize_jaeger_trace(trace: JaegerTrace) -> TraceSummary {
    let trace_id = trace.trace_id.clone();
    let assembled = assemble_trace(&trace_id, jaeger_spans(trace));
    crate::models::trace::summarize_trace(&assembled)
}

// ── TraceQL ──

/// Escape a literal for embedding in a TraceQL string: backslashes and
/// double quotes.
pub(crate) fn escape_traceql(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

/// The outbound TraceQL expression: an explicit query wins, then a service
/// filter, then match-everything.
pub(crate) fn build_traceql(req: &TraceSearchRequest) -> String {
    if let Some(query) = req.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        return query.to_string();
    }
    if let Some(service) = req.service.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return format!("{{ .service.name = \"{}\" }}", escape_traceql(service));
    }
    "{}".to_string()
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    traces: Vec<SearchTrace>,
}

#[derive(Debug, Deserialize)]
struct SearchTrace {
    #[serde(rename = "traceID", default)]
    trace_id: String,
    #[serde(rename = "rootServiceName", default)]
    root_service_name: String,
    #[serde(rename = "rootTraceName", default)]
    root_trace_name: String,
    #[serde(rename = "startTimeUnixNano", default)]
    start_time_unix_nano: serde_json::Value,
    #[serde(rename = "durationMs", default)]
    duration_ms: u64,
    #[serde(rename = "spanSet", default)]
    span_set: Option<SearchSpanSet>,
}

#[derive(Debug, Deserialize)]
struct SearchSpanSet {
    #[serde(default)]
    matched: usize,
}

fn parse_search_response(bytes: &[u8]) -> Result<Vec<TraceSummary>, ApiError> {
    let parsed: SearchResponse =
        serde_json::from_slice(bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
    Ok(parsed
        .traces
        .into_iter()
        .map(|t| TraceSummary {
            trace_id: t.trace_id,
            root_service_name: t.root_service_name,
            root_operation_name: t.root_trace_name,
            start_time_unix_nano: value_to_u64(&t.start_time_unix_nano),
            duration_nano: t.duration_ms.saturating_mul(1_000_000),
            span_count: t.span_set.as_ref().map(|s| s.matched).unwrap_or(0),
            service_count: 0,
            error_span_count: 0,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct TagValuesResponse {
    #[serde(rename = "tagValues", default)]
    tag_values: Vec<String>,
}

#[async_trait]
impl Adapter for TempoAdapter {
    async fn query(
        &self,
        _query: &str,
        _signal: Signal,
        _window: TimeWindow,
        _limit: i64,
    ) -> Result<QueryResult, ApiError> {
        // Trace lookups go through the dedicated trace endpoints.
        Err(ApiError::invalid(
            "trace datasources are queried through the /traces endpoints",
        ))
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Trace, ApiError> {
        let trace_id = trace_id.trim();
        if trace_id.is_empty() {
            return Err(ApiError::invalid("trace id must not be empty"));
        }
        let url = resolve_endpoint(&self.ds.url, &format!("api/traces/{trace_id}"))?;
        let builder = self.http.get(url).timeout(QUERY_TIMEOUT);
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        parse_trace_document(trace_id, &bytes)
    }

    async fn search_traces(&self, req: &TraceSearchRequest) -> Result<Vec<TraceSummary>, ApiError> {
        let limit = clamp_search_limit(req.limit);
        let mut url = resolve_endpoint(&self.ds.url, "api/search")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("query", &build_traceql(req));
            pairs.append_pair("limit", &limit.to_string());
            if let Some(start) = req.start {
                pairs.append_pair("start", &start.to_string());
            }
            if let Some(end) = req.end {
                pairs.append_pair("end", &end.to_string());
            }
        }
        let builder = self.http.get(url).timeout(QUERY_TIMEOUT);
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        Ok(normalize_search_results(parse_search_response(&bytes)?, limit))
    }

    async fn services(&self) -> Result<Vec<String>, ApiError> {
        let url = resolve_endpoint(&self.ds.url, "api/search/tag/service.name/values")?;
        let builder = self.http.get(url).timeout(DISCOVERY_TIMEOUT);
        let response = send(&self.http, &self.ds, builder).await?;
        let parsed: TagValuesResponse =
            response.json().await.map_err(|e| ApiError::ParseError(e.to_string()))?;
        let mut services = parsed.tag_values;
        services.sort();
        services.dedup();
        Ok(services)
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(&self.http, &self.ds, &["ready", "api/echo", "status/buildinfo"]).await
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One span in canonical form, flattened out of whatever envelope the
/// backend used (Jaeger `data[]`, Tempo/OTLP `batches[]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub service_name: String,
    pub operation_name: String,
    pub start_time_unix_nano: u64,
    pub duration_nano: u64,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<SpanLog>,
    /// Empty, or `error`.
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpanLog {
    pub timestamp_unix_nano: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// A fully assembled trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<TraceSpan>,
    pub services: Vec<String>,
    pub start_time_unix_nano: u64,
    pub duration_nano: u64,
}

/// Compact trace row for search results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_service_name: String,
    pub root_operation_name: String,
    pub start_time_unix_nano: u64,
    pub duration_nano: u64,
    pub span_count: usize,
    pub service_count: usize,
    pub error_span_count: usize,
}

// ── Service graph ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGraphNode {
    pub service: String,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_duration_nano: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGraphEdge {
    pub source: String,
    pub target: String,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_duration_nano: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceGraph {
    pub nodes: Vec<ServiceGraphNode>,
    pub edges: Vec<ServiceGraphEdge>,
}

/// Trimmed service name, with empty falling back to `unknown`.
pub fn normalize_service_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether a span's tags mark it as failed: `error` ∈ {true, 1, error} or
/// `otel.status_code` = error.
pub fn tags_mark_error(tags: &BTreeMap<String, serde_json::Value>) -> bool {
    if let Some(v) = tags.get("error") {
        let hit = match v {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_i64() == Some(1),
            serde_json::Value::String(s) => {
                matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "error")
            }
            _ => false,
        };
        if hit {
            return true;
        }
    }
    matches!(tags.get("otel.status_code"), Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("error"))
}

/// Assemble the canonical trace envelope from flattened spans: sorted unique
/// services, earliest start, and wall-clock duration clamped at zero.
pub fn assemble_trace(trace_id: &str, spans: Vec<TraceSpan>) -> Trace {
    let mut services: Vec<String> = spans.iter().map(|s| s.service_name.clone()).collect();
    services.sort();
    services.dedup();

    let start = spans.iter().map(|s| s.start_time_unix_nano).min().unwrap_or(0);
    let end = spans
        .iter()
        .map(|s| s.start_time_unix_nano.saturating_add(s.duration_nano))
        .max()
        .unwrap_or(0);

    Trace {
        trace_id: trace_id.to_string(),
        spans,
        services,
        start_time_unix_nano: start,
        duration_nano: end.saturating_sub(start),
    }
}

/// Summarise a trace for search listings.
pub fn summarize_trace(trace: &Trace) -> TraceSummary {
    let root = trace
        .spans
        .iter()
        .find(|s| s.parent_span_id.as_deref().is_none_or(|p| p.is_empty()))
        .or_else(|| trace.spans.iter().min_by_key(|s| s.start_time_unix_nano));
    TraceSummary {
        trace_id: trace.trace_id.clone(),
        root_service_name: root.map(|s| s.service_name.clone()).unwrap_or_default(),
        root_operation_name: root.map(|s| s.operation_name.clone()).unwrap_or_default(),
        start_time_unix_nano: trace.start_time_unix_nano,
        duration_nano: trace.duration_nano,
        span_count: trace.spans.len(),
        service_count: trace.services.len(),
        error_span_count: trace.spans.iter().filter(|s| s.status == "error").count(),
    }
}

/// Derive the per-trace service dependency graph.
///
/// Every span credits one request to its service node. Every span whose
/// parent resolves within the trace and lives in a different service credits
/// one edge `parent_service → child_service` with the child's duration and
/// error flag. Self-loops are omitted; output is sorted by name.
pub fn derive_service_graph(trace: &Trace) -> ServiceGraph {
    #[derive(Default)]
    struct Stats {
        requests: u64,
        errors: u64,
        duration_sum: u128,
    }

    impl Stats {
        fn credit(&mut self, span: &TraceSpan) {
            self.requests += 1;
            if span.status == "error" {
                self.errors += 1;
            }
            self.duration_sum += u128::from(span.duration_nano);
        }

        fn rate(&self) -> f64 {
            if self.requests == 0 {
                0.0
            } else {
                self.errors as f64 / self.requests as f64
            }
        }

        fn avg(&self) -> u64 {
            if self.requests == 0 {
                0
            } else {
                (self.duration_sum / u128::from(self.requests)) as u64
            }
        }
    }

    let by_id: HashMap<&str, &TraceSpan> =
        trace.spans.iter().map(|s| (s.span_id.as_str(), s)).collect();

    let mut nodes: BTreeMap<String, Stats> = BTreeMap::new();
    let mut edges: BTreeMap<(String, String), Stats> = BTreeMap::new();

    for span in &trace.spans {
        nodes.entry(span.service_name.clone()).or_default().credit(span);

        let Some(parent_id) = span.parent_span_id.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        let Some(parent) = by_id.get(parent_id) else {
            continue;
        };
        if parent.service_name == span.service_name {
            continue;
        }
        edges
            .entry((parent.service_name.clone(), span.service_name.clone()))
            .or_default()
            .credit(span);
    }

    ServiceGraph {
        nodes: nodes
            .into_iter()
            .map(|(service, s)| ServiceGraphNode {
                service,
                request_count: s.requests,
                error_count: s.errors,
                error_rate: s.rate(),
                average_duration_nano: s.avg(),
            })
            .collect(),
        edges: edges
            .into_iter()
            .map(|((source, target), s)| ServiceGraphEdge {
                source,
                target,
                request_count: s.requests,
                error_count: s.errors,
                error_rate: s.rate(),
                average_duration_nano: s.avg(),
            })
            .collect(),
    }
}

/// Post-process trace search results: trim ids, drop empties, dedup keeping
/// the most recent entry per id, sort newest-first (id ascending on ties),
/// and truncate to the limit.
pub fn normalize_search_results(results: Vec<TraceSummary>, limit: usize) -> Vec<TraceSummary> {
    let mut newest: HashMap<String, TraceSummary> = HashMap::new();
    for mut summary in results {
        let id = summary.trace_id.trim().to_string();
        if id.is_empty() {
            continue;
        }
        summary.trace_id = id.clone();
        match newest.get(&id) {
            Some(existing) if existing.start_time_unix_nano >= summary.start_time_unix_nano => {}
            _ => {
                newest.insert(id, summary);
            }
        }
    }

    let mut out: Vec<TraceSummary> = newest.into_values().collect();
    out.sort_by(|a, b| {
        b.start_time_unix_nano
            .cmp(&a.start_time_unix_nano)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
    out.truncate(limit);
    out
}

pub const SEARCH_DEFAULT_LIMIT: usize = 20;
pub const SEARCH_MAX_LIMIT: usize = 1000;

/// Clamp a caller-supplied search limit into [1, 1000], defaulting to 20.
pub fn clamp_search_limit(limit: Option<i64>) -> usize {
    match limit {
        Some(n) if n > 0 => (n as usize).min(SEARCH_MAX_LIMIT),
        _ => SEARCH_DEFAULT_LIMIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, parent: Option<&str>, service: &str, status: &str, start: u64, dur: u64) -> TraceSpan {
        TraceSpan {
            span_id: id.to_string(),
            parent_span_id: parent.map(str::to_string),
            service_name: normalize_service_name(service),
            operation_name: format!("op-{id}"),
            start_time_unix_nano: start,
            duration_nano: dur,
            tags: BTreeMap::new(),
            logs: Vec::new(),
            status: status.to_string(),
        }
    }

    fn three_service_trace() -> Trace {
        assemble_trace(
            "abc",
            vec![
                span("root", None, "api", "", 1_000, 500),
                span("db", Some("root"), "postgres", "error", 1_100, 200),
                span("cache", Some("root"), "redis", "", 1_150, 50),
            ],
        )
    }

    #[test]
    fn graph_shape_for_three_services() {
        let g = derive_service_graph(&three_service_trace());
        assert_eq!(g.nodes.len(), 3);
        assert_eq!(g.edges.len(), 2);

        let to_pg = g.edges.iter().find(|e| e.target == "postgres").unwrap();
        assert_eq!(to_pg.source, "api");
        assert_eq!(to_pg.error_count, 1);
        let to_redis = g.edges.iter().find(|e| e.target == "redis").unwrap();
        assert_eq!(to_redis.error_count, 0);

        let node_errors: u64 = g.nodes.iter().map(|n| n.error_count).sum();
        assert_eq!(node_errors, 1);
    }

    #[test]
    fn graph_invariants() {
        let trace = three_service_trace();
        let g = derive_service_graph(&trace);
        let node_requests: u64 = g.nodes.iter().map(|n| n.request_count).sum();
        assert_eq!(node_requests as usize, trace.spans.len());
        let edge_requests: u64 = g.edges.iter().map(|e| e.request_count).sum();
        assert!(edge_requests as usize <= trace.spans.len() - 1);
        assert!(g.edges.iter().all(|e| e.source != e.target));
        assert!(g.nodes.iter().all(|n| (0.0..=1.0).contains(&n.error_rate)));
        assert!(g.edges.iter().all(|e| (0.0..=1.0).contains(&e.error_rate)));
    }

    #[test]
    fn same_service_parent_child_is_not_an_edge() {
        let trace = assemble_trace(
            "t",
            vec![
                span("a", None, "api", "", 0, 10),
                span("b", Some("a"), "api", "", 1, 5),
            ],
        );
        let g = derive_service_graph(&trace);
        assert!(g.edges.is_empty());
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].request_count, 2);
    }

    #[test]
    fn empty_trace_gives_zero_graph() {
        let g = derive_service_graph(&assemble_trace("t", vec![]));
        assert!(g.nodes.is_empty());
        assert!(g.edges.is_empty());
    }

    #[test]
    fn trace_duration_clamps_and_spans_sorted_services() {
        let t = three_service_trace();
        assert_eq!(t.start_time_unix_nano, 1_000);
        assert_eq!(t.duration_nano, 500);
        assert_eq!(t.services, vec!["api", "postgres", "redis"]);
    }

    #[test]
    fn error_tag_shapes() {
        for v in [
            serde_json::json!(true),
            serde_json::json!(1),
            serde_json::json!("true"),
            serde_json::json!("error"),
        ] {
            let tags: BTreeMap<String, serde_json::Value> = [("error".to_string(), v)].into();
            assert!(tags_mark_error(&tags));
        }
        let tags: BTreeMap<String, serde_json::Value> =
            [("otel.status_code".to_string(), serde_json::json!("ERROR"))].into();
        assert!(tags_mark_error(&tags));
        let tags: BTreeMap<String, serde_json::Value> =
            [("error".to_string(), serde_json::json!("false"))].into();
        assert!(!tags_mark_error(&tags));
    }

    fn summary(id: &str, start: u64) -> TraceSummary {
        TraceSummary {
            trace_id: id.to_string(),
            root_service_name: "api".into(),
            root_operation_name: "GET /".into(),
            start_time_unix_nano: start,
            duration_nano: 1,
            span_count: 1,
            service_count: 1,
            error_span_count: 0,
        }
    }

    #[test]
    fn search_normalisation_dedups_and_sorts() {
        let input = vec![
            summary("  b  ", 10),
            summary("a", 30),
            summary("b", 20),
            summary("", 99),
            summary("c", 30),
        ];
        let out = normalize_search_results(input, 10);
        let ids: Vec<&str> = out.iter().map(|s| s.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(out.iter().find(|s| s.trace_id == "b").unwrap().start_time_unix_nano, 20);
    }

    #[test]
    fn search_normalisation_is_idempotent_and_bounded() {
        let input = vec![summary("a", 3), summary("b", 2), summary("a", 5), summary("c", 1)];
        let once = normalize_search_results(input.clone(), 2);
        let twice = normalize_search_results(once.clone(), 2);
        assert_eq!(once, twice);
        assert!(once.len() <= 2);
        assert!(once.windows(2).all(|w| w[0].start_time_unix_nano > w[1].start_time_unix_nano
            || (w[0].start_time_unix_nano == w[1].start_time_unix_nano
                && w[0].trace_id < w[1].trace_id)));
    }

    #[test]
    fn limit_clamping() {
        assert_eq!(clamp_search_limit(None), 20);
        assert_eq!(clamp_search_limit(Some(0)), 20);
        assert_eq!(clamp_search_limit(Some(-5)), 20);
        assert_eq!(clamp_search_limit(Some(25)), 25);
        assert_eq!(clamp_search_limit(Some(10_000)), 1000);
    }

    #[test]
    fn service_name_normalisation() {
        assert_eq!(normalize_service_name("  api  "), "api");
        assert_eq!(normalize_service_name(""), "unknown");
        assert_eq!(normalize_service_name("   "), "unknown");
    }
}

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::metrics::MetricSeries;
use super::trace::TraceSpan;
use crate::error::ApiError;

/// The capability class of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Metrics,
    Logs,
    Traces,
}

impl Signal {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metrics" => Some(Self::Metrics),
            "logs" => Some(Self::Logs),
            "traces" => Some(Self::Traces),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Logs => "logs",
            Self::Traces => "traces",
        }
    }
}

pub const DEFAULT_STEP_SECS: i64 = 15;

/// A resolved query time window, all in Unix seconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl TimeWindow {
    /// Validates the range and defaults non-positive steps to 15 s.
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self, ApiError> {
        if end < start {
            return Err(ApiError::invalid("end must not be before start"));
        }
        let step = if step <= 0 { DEFAULT_STEP_SECS } else { step };
        Ok(Self { start, end, step })
    }

    pub fn start_nanos(&self) -> i64 {
        self.start.saturating_mul(1_000_000_000)
    }

    pub fn end_nanos(&self) -> i64 {
        self.end.saturating_mul(1_000_000_000)
    }

    pub fn start_millis(&self) -> i64 {
        self.start.saturating_mul(1_000)
    }

    pub fn end_millis(&self) -> i64 {
        self.end.saturating_mul(1_000)
    }
}

/// Body of `POST /api/datasources/{id}/query`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub signal: Option<String>,
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub step: i64,
    #[serde(default)]
    pub limit: i64,
}

/// Body of `POST /api/datasources/{id}/traces/search`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSearchRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub min_duration: Option<String>,
    #[serde(default)]
    pub max_duration: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ── Canonical response envelope ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<MetricSeries>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<TraceSpan>,
}

/// The canonical query response: `status`, signal-level `resultType`, and a
/// `data` block whose inner `resultType` names the wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub data: QueryData,
}

impl QueryResult {
    pub fn metrics(series: Vec<MetricSeries>) -> Self {
        Self {
            status: "success".into(),
            error: None,
            result_type: Signal::Metrics.as_str().into(),
            data: QueryData {
                result_type: "matrix".into(),
                result: series,
                logs: Vec::new(),
                traces: Vec::new(),
            },
        }
    }

    pub fn logs(entries: Vec<LogEntry>) -> Self {
        Self {
            status: "success".into(),
            error: None,
            result_type: Signal::Logs.as_str().into(),
            data: QueryData {
                result_type: "streams".into(),
                result: Vec::new(),
                logs: entries,
                traces: Vec::new(),
            },
        }
    }

    pub fn traces(spans: Vec<TraceSpan>) -> Self {
        Self {
            status: "success".into(),
            error: None,
            result_type: Signal::Traces.as_str().into(),
            data: QueryData {
                result_type: "trace".into(),
                result: Vec::new(),
                logs: Vec::new(),
                traces: spans,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing() {
        assert_eq!(Signal::parse("metrics"), Some(Signal::Metrics));
        assert_eq!(Signal::parse("LOGS"), Some(Signal::Logs));
        assert_eq!(Signal::parse("spans"), None);
    }

    #[test]
    fn window_defaults_step() {
        let w = TimeWindow::new(100, 200, 0).unwrap();
        assert_eq!(w.step, DEFAULT_STEP_SECS);
        let w = TimeWindow::new(100, 200, -3).unwrap();
        assert_eq!(w.step, DEFAULT_STEP_SECS);
        assert!(TimeWindow::new(200, 100, 15).is_err());
    }

    #[test]
    fn envelope_shape() {
        let body = serde_json::to_value(QueryResult::logs(vec![])).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["resultType"], "logs");
        assert_eq!(body["data"]["resultType"], "streams");
        assert!(body.get("error").is_none());
    }
}

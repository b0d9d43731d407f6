use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use super::{
    Adapter, DISCOVERY_TIMEOUT, QUERY_TIMEOUT, effective_limit, probe_candidates, require_query,
    resolve_endpoint, send, unsupported_signal,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::log::LogEntry;
use crate::models::query::{QueryResult, Signal, TimeWindow};
use crate::timeparse;

const DEFAULT_LIMIT: i64 = 1000;

/// VictoriaLogs speaks LogsQL over plain HTTP; query results and the tail
/// endpoint both emit one JSON object per line, with `_msg` as the log line,
/// `_time` as the timestamp, and every other field a label.
pub struct VictoriaLogsAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl VictoriaLogsAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }
}

pub(crate) fn entry_from_jsonl(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line).ok()?;

    let mut message = String::new();
    let mut timestamp = String::new();
    let mut labels = BTreeMap::new();
    for (key, value) in object {
        match key.as_str() {
            "_msg" => message = scalar_to_string(&value),
            "_time" => {
                timestamp = timeparse::parse_flexible(&value)
                    .map(timeparse::rfc3339_nanos)
                    .unwrap_or_else(|| scalar_to_string(&value));
            }
            _ => {
                labels.insert(key, scalar_to_string(&value));
            }
        }
    }
    Some(LogEntry::new(timestamp, message, labels))
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn parse_jsonl_body(body: &str) -> Vec<LogEntry> {
    body.lines().filter_map(entry_from_jsonl).collect()
}

#[async_trait]
impl Adapter for VictoriaLogsAdapter {
    async fn query(
        &self,
        query: &str,
        signal: Signal,
        window: TimeWindow,
        limit: i64,
    ) -> Result<QueryResult, ApiError> {
        if signal != Signal::Logs {
            return Err(unsupported_signal(self.ds.ds_type, signal, &[Signal::Logs]));
        }
        let query = require_query(query)?;
        let limit = effective_limit(limit, DEFAULT_LIMIT);

        let url = resolve_endpoint(&self.ds.url, "select/logsql/query")?;
        let builder = self
            .http
            .get(url)
            .timeout(QUERY_TIMEOUT)
            .query(&[
                ("query", query),
                ("start", &timeparse::epoch_to_rfc3339(window.start)),
                ("end", &timeparse::epoch_to_rfc3339(window.end)),
                ("limit", &limit.to_string()),
            ]);
        let response = send(&self.http, &self.ds, builder).await?;
        let body = response.text().await.map_err(ApiError::from_reqwest)?;
        Ok(QueryResult::logs(parse_jsonl_body(&body)))
    }

    async fn labels(&self) -> Result<Vec<String>, ApiError> {
        let url = resolve_endpoint(&self.ds.url, "select/logsql/field_names")?;
        let builder = self
            .http
            .get(url)
            .timeout(DISCOVERY_TIMEOUT)
            .query(&[("query", "*")]);
        let response = send(&self.http, &self.ds, builder).await?;
        let body: serde_json::Value = response.json().await.map_err(|e| ApiError::ParseError(e.to_string()))?;
        Ok(parse_values_response(&body))
    }

    async fn label_values(&self, name: &str) -> Result<Vec<String>, ApiError> {
        let url = resolve_endpoint(&self.ds.url, "select/logsql/field_values")?;
        let builder = self
            .http
            .get(url)
            .timeout(DISCOVERY_TIMEOUT)
            .query(&[("query", "*"), ("field", name)]);
        let response = send(&self.http, &self.ds, builder).await?;
        let body: serde_json::Value = response.json().await.map_err(|e| ApiError::ParseError(e.to_string()))?;
        Ok(parse_values_response(&body))
    }

    async fn stream(
        &self,
        query: &str,
        start: Option<i64>,
        _limit: i64,
        tx: mpsc::Sender<LogEntry>,
    ) -> Result<(), ApiError> {
        let query = require_query(query)?;

        let url = resolve_endpoint(&self.ds.url, "select/logsql/tail")?;
        let mut builder = self.http.get(url).query(&[("query", query)]);
        if let Some(start) = start {
            // Best-effort resume from a prior cursor.
            builder = builder.query(&[("start_offset", &timeparse::epoch_to_rfc3339(start))]);
        }
        // No overall timeout: the long-poll lives until either side closes.
        let response = super::check_status(
            self.http
                .execute(super::injector::apply(builder, &self.ds)?)
                .await
                .map_err(ApiError::from_reqwest)?,
        )
        .await?;

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ApiError::UpstreamError {
                status: 0,
                body: format!("tail read: {e}"),
            })?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let Ok(text) = std::str::from_utf8(&line) else { continue };
                if let Some(entry) = entry_from_jsonl(text) {
                    if tx.send(entry).await.is_err() {
                        // Receiver dropped; dropping the response body closes
                        // the long-poll.
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(&self.http, &self.ds, &["health", "select/logsql/field_names?query=*"]).await
    }
}

/// Both field_names and field_values answer `{"values": [...]}`, with items
/// either bare strings or `{"value": ..., "hits": ...}` objects depending on
/// the server version.
fn parse_values_response(body: &serde_json::Value) -> Vec<String> {
    body.get("values")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(o) => {
                        o.get("value").and_then(|v| v.as_str()).map(str::to_string)
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use super::{
    Adapter, QUERY_TIMEOUT, effective_limit, injector, probe_candidates, require_query,
    resolve_endpoint, send, unsupported_signal,
};
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::log::LogEntry;
use crate::models::query::{QueryResult, Signal, TimeWindow};
use crate::timeparse;

const DEFAULT_LIMIT: i64 = 1000;

pub struct LokiAdapter {
    ds: DataSource,
    http: reqwest::Client,
}

impl LokiAdapter {
    pub fn new(ds: DataSource, http: reqwest::Client) -> Self {
        Self { ds, http }
    }
}

#[derive(Debug, Deserialize)]
struct LokiResponse {
    #[serde(default)]
    data: LokiData,
}

#[derive(Debug, Default, Deserialize)]
struct LokiData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

/// One stream: a label set plus `[nanosecond_string, line]` pairs. The tail
/// WebSocket sends the same shape under `streams`.
#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct TailFrame {
    #[serde(default)]
    streams: Vec<LokiStream>,
}

fn entries_from_streams(streams: Vec<LokiStream>) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for stream in streams {
        for (ts, line) in stream.values {
            let timestamp = match ts.parse::<i64>() {
                Ok(ns) => timeparse::epoch_to_rfc3339(ns),
                Err(_) => ts,
            };
            entries.push(LogEntry::new(timestamp, line, stream.stream.clone()));
        }
    }
    entries
}

pub(crate) fn parse_query_response(bytes: &[u8]) -> Result<Vec<LogEntry>, ApiError> {
    let parsed: LokiResponse =
        serde_json::from_slice(bytes).map_err(|e| ApiError::ParseError(e.to_string()))?;
    Ok(entries_from_streams(parsed.data.result))
}

#[derive(Debug, Deserialize)]
struct NamesResponse {
    #[serde(default)]
    data: Vec<String>,
}

#[async_trait]
impl Adapter for LokiAdapter {
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

        let url = resolve_endpoint(&self.ds.url, "loki/api/v1/query_range")?;
        let builder = self
            .http
            .get(url)
            .timeout(QUERY_TIMEOUT)
            .query(&[
                ("query", query),
                ("start", &window.start_nanos().to_string()),
                ("end", &window.end_nanos().to_string()),
                ("limit", &limit.to_string()),
            ]);
        let response = send(&self.http, &self.ds, builder).await?;
        let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
        Ok(QueryResult::logs(parse_query_response(&bytes)?))
    }

    async fn labels(&self) -> Result<Vec<String>, ApiError> {
        let url = resolve_endpoint(&self.ds.url, "loki/api/v1/labels")?;
        let builder = self.http.get(url).timeout(super::DISCOVERY_TIMEOUT);
        let response = send(&self.http, &self.ds, builder).await?;
        let parsed: NamesResponse = response.json().await.map_err(|e| ApiError::ParseError(e.to_string()))?;
        Ok(parsed.data)
    }

    async fn label_values(&self, name: &str) -> Result<Vec<String>, ApiError> {
        let url = resolve_endpoint(&self.ds.url, &format!("loki/api/v1/label/{name}/values"))?;
        let builder = self.http.get(url).timeout(super::DISCOVERY_TIMEOUT);
        let response = send(&self.http, &self.ds, builder).await?;
        let parsed: NamesResponse = response.json().await.map_err(|e| ApiError::ParseError(e.to_string()))?;
        Ok(parsed.data)
    }

    async fn stream(
        &self,
        query: &str,
        start: Option<i64>,
        limit: i64,
        tx: mpsc::Sender<LogEntry>,
    ) -> Result<(), ApiError> {
        let query = require_query(query)?;
        let limit = effective_limit(limit, DEFAULT_LIMIT);

        let mut url = resolve_endpoint(&self.ds.url, "loki/api/v1/tail")?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("limit", &limit.to_string());
        if let Some(start) = start {
            // Best-effort resume: Loki takes nanoseconds since epoch.
            url.query_pairs_mut()
                .append_pair("start", &start.saturating_mul(1_000_000_000).to_string());
        }
        let ws_scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        let ws_url = format!("{ws_scheme}{}", &url.as_str()[url.scheme().len()..]);

        let mut request = ws_url
            .into_client_request()
            .map_err(|e| ApiError::invalid(format!("cannot build tail request: {e}")))?;
        for (name, value) in injector::static_headers(&self.ds)? {
            request.headers_mut().insert(name, value);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| ApiError::UpstreamError { status: 0, body: format!("tail connect: {e}") })?;
        let (_, mut read) = socket.split();

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame: TailFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => return Err(ApiError::ParseError(format!("tail frame: {e}"))),
                    };
                    for entry in entries_from_streams(frame.streams) {
                        if tx.send(entry).await.is_err() {
                            // Receiver is gone (client disconnected); closing
                            // the socket stops the backend tail.
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    return Err(ApiError::UpstreamError { status: 0, body: format!("tail read: {e}") });
                }
            }
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        probe_candidates(&self.http, &self.ds, &["ready", "loki/api/v1/labels"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_flatten_to_canonical_entries() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [{
                    "stream": {"job": "api"},
                    "values": [
                        ["1700000000123456789", "Error: boom"],
                        ["1700000100000000000", "warn msg"]
                    ]
                }]
            }
        });
        let entries = parse_query_response(serde_json::to_vec(&body).unwrap().as_slice()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, "2023-11-14T22:13:20.123456789Z");
        assert_eq!(entries[0].level, "error");
        assert_eq!(entries[0].labels["job"], "api");
        assert_eq!(entries[1].timestamp, "2023-11-14T22:15:00Z");
        assert_eq!(entries[1].level, "warning");
    }

    #[test]
    fn empty_result_is_fine() {
        let body = serde_json::json!({"status": "success", "data": {"result": []}});
        let entries = parse_query_response(serde_json::to_vec(&body).unwrap().as_slice()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        assert!(matches!(
            parse_query_response(b"not json"),
            Err(ApiError::ParseError(_))
        ));
    }
}

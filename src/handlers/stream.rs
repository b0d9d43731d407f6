use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{authorize, load_datasource};
use crate::AppState;
use crate::adapters::build_adapter;
use crate::authn::Principal;
use crate::authz::Action;
use crate::error::ApiError;
use crate::models::datasource::DsType;
use crate::models::log::LogEntry;

/// Entries buffered between the backend tail and the SSE writer. A slow
/// client fills this up, the producer blocks on send, and the backpressure
/// reaches the backend tail.
const ENTRY_BUFFER: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub query: String,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn stream_logs(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<StreamRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    if !matches!(ds.ds_type, DsType::Loki | DsType::VictoriaLogs) {
        return Err(ApiError::invalid(format!(
            "live streaming is only available for loki and victorialogs datasources, not {}",
            ds.ds_type.as_str()
        )));
    }
    if req.query.trim().is_empty() {
        return Err(ApiError::invalid("query must not be empty"));
    }

    let adapter = build_adapter(&ds, &state.http);
    let (entry_tx, entry_rx) = mpsc::channel::<LogEntry>(ENTRY_BUFFER);
    let (done_tx, done_rx) = mpsc::channel::<Result<(), ApiError>>(1);
    let (frame_tx, frame_rx) = mpsc::channel::<Event>(16);

    // Producer: runs the backend tail until it ends, fails, or the entry
    // receiver disappears.
    let query = req.query.clone();
    let start = req.start;
    let limit = req.limit.unwrap_or(0);
    tokio::spawn(async move {
        let result = adapter.stream(&query, start, limit, entry_tx).await;
        let _ = done_tx.send(result).await;
    });

    // Pump: multiplexes entries, heartbeats, and the terminal result into
    // SSE frames. When the client disconnects the frame receiver drops, the
    // sends here fail, and dropping `entry_rx` stops the producer in turn.
    tokio::spawn(pump(entry_rx, done_rx, frame_tx));

    let stream = ReceiverStream::new(frame_rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream).into_response();
    // Reverse proxies must not buffer the event stream.
    response
        .headers_mut()
        .insert("X-Accel-Buffering", axum::http::HeaderValue::from_static("no"));
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-store"),
    );
    Ok(response)
}

async fn pump(
    mut entry_rx: mpsc::Receiver<LogEntry>,
    mut done_rx: mpsc::Receiver<Result<(), ApiError>>,
    frame_tx: mpsc::Sender<Event>,
) {
    if frame_tx
        .send(Event::default().event("status").data(r#"{"status":"streaming"}"#))
        .await
        .is_err()
    {
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            entry = entry_rx.recv() => match entry {
                Some(entry) => {
                    if send_log(&frame_tx, &entry).await.is_err() {
                        return;
                    }
                }
                // Entry channel closed: the producer is done; its result
                // arrives on done_rx next.
                None => break,
            },
            _ = heartbeat.tick() => {
                if frame_tx.send(Event::default().event("heartbeat").data("{}")).await.is_err() {
                    return;
                }
            }
            result = done_rx.recv() => {
                drain_entries(&mut entry_rx, &frame_tx).await;
                if let Some(Err(err)) = result {
                    send_error(&frame_tx, &err).await;
                }
                return;
            }
        }
    }

    // Producer finished while entries were still buffered; flush, then
    // report a terminal error if there was one.
    if let Some(Err(err)) = done_rx.recv().await {
        send_error(&frame_tx, &err).await;
    }
}

async fn drain_entries(entry_rx: &mut mpsc::Receiver<LogEntry>, frame_tx: &mpsc::Sender<Event>) {
    while let Ok(entry) = entry_rx.try_recv() {
        if send_log(frame_tx, &entry).await.is_err() {
            return;
        }
    }
}

async fn send_log(frame_tx: &mpsc::Sender<Event>, entry: &LogEntry) -> Result<(), ()> {
    let payload = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
    frame_tx
        .send(Event::default().event("log").data(payload))
        .await
        .map_err(|_| ())
}

async fn send_error(frame_tx: &mpsc::Sender<Event>, err: &ApiError) {
    let payload = serde_json::json!({ "error": err.to_string() }).to_string();
    let _ = frame_tx.send(Event::default().event("error").data(payload)).await;
}

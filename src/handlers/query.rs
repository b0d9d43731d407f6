use axum::{
    Extension, Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};

use super::{authorize, load_datasource};
use crate::AppState;
use crate::adapters::build_adapter;
use crate::authn::Principal;
use crate::authz::Action;
use crate::error::ApiError;
use crate::models::datasource::DsType;
use crate::models::query::{QueryRequest, Signal, TimeWindow};

/// The signal a query runs as when the caller leaves it blank: the
/// datasource's primary capability. An empty signal on a multi-signal
/// backend (clickhouse, cloudwatch, elasticsearch) therefore behaves exactly
/// like its primary one.
pub(crate) fn default_signal(ds_type: DsType) -> Signal {
    if ds_type.is_logs() {
        Signal::Logs
    } else if ds_type.is_traces() {
        Signal::Traces
    } else {
        Signal::Metrics
    }
}

pub async fn query_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;

    let signal = match req.signal.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Signal::parse(raw).ok_or_else(|| {
            ApiError::invalid(format!("unknown signal {raw} (expected metrics, logs or traces)"))
        })?,
        None => default_signal(ds.ds_type),
    };
    let window = TimeWindow::new(req.start, req.end, req.step)?;

    let adapter = build_adapter(&ds, &state.http);
    let result = adapter.query(&req.query, signal, window, req.limit).await?;

    Ok(([(header::CACHE_CONTROL, "no-store")], Json(result)))
}

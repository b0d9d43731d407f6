use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::{authorize, load_datasource};
use crate::AppState;
use crate::adapters::build_adapter;
use crate::authn::Principal;
use crate::authz::Action;
use crate::error::ApiError;
use crate::models::datasource::DataSource;
use crate::models::query::TraceSearchRequest;
use crate::models::trace::derive_service_graph;

fn require_traces(ds: &DataSource) -> Result<(), ApiError> {
    if ds.ds_type.is_traces() {
        Ok(())
    } else {
        Err(ApiError::invalid(format!(
            "trace endpoints are only available for tracing datasources, not {}",
            ds.ds_type.as_str()
        )))
    }
}

pub async fn get_trace(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, trace_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_traces(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let trace = adapter.get_trace(&trace_id).await?;
    Ok(Json(trace))
}

pub async fn get_service_graph(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, trace_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_traces(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let trace = adapter.get_trace(&trace_id).await?;
    Ok(Json(derive_service_graph(&trace)))
}

pub async fn search_traces(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<TraceSearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_traces(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let traces = adapter.search_traces(&req).await?;
    Ok(Json(serde_json::json!({ "traces": traces })))
}

pub async fn list_services(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_traces(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let services = adapter.services().await?;
    Ok(Json(serde_json::json!({ "services": services })))
}

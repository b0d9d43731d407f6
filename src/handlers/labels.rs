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

fn require_logs(ds: &DataSource) -> Result<(), ApiError> {
    if ds.ds_type.is_logs() {
        Ok(())
    } else {
        Err(ApiError::invalid(format!(
            "label discovery is only available for log datasources, not {}",
            ds.ds_type.as_str()
        )))
    }
}

pub async fn list_labels(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_logs(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let labels = adapter.labels().await?;
    Ok(Json(serde_json::json!({ "labels": labels })))
}

pub async fn list_label_values(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    require_logs(&ds)?;
    let adapter = build_adapter(&ds, &state.http);
    let values = adapter.label_values(&name).await?;
    Ok(Json(serde_json::json!({ "values": values })))
}

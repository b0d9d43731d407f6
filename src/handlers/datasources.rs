use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{authorize, load_datasource};
use crate::AppState;
use crate::adapters::build_adapter;
use crate::authn::Principal;
use crate::authz::Action;
use crate::error::ApiError;
use crate::models::datasource::{AuthType, DataSource, DsType};

#[derive(Debug, Deserialize)]
pub struct DataSourceBody {
    pub name: String,
    #[serde(rename = "type")]
    pub ds_type: String,
    pub url: String,
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub auth_config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub is_default: bool,
}

fn validate(body: &DataSourceBody) -> Result<(DsType, AuthType), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::invalid("name must not be empty"));
    }
    let ds_type = DsType::parse(&body.ds_type)
        .ok_or_else(|| ApiError::invalid(format!("unknown datasource type {}", body.ds_type)))?;
    reqwest::Url::parse(&body.url)
        .map_err(|e| ApiError::invalid(format!("url is not a valid absolute url: {e}")))?;
    let auth_type = AuthType::parse(&body.auth_type)
        .ok_or_else(|| ApiError::invalid(format!("unknown auth type {}", body.auth_type)))?;
    Ok((ds_type, auth_type))
}

/// Create/list are org-scoped: non-members get 404 for the org, members
/// without the admin role get 403 on writes.
fn require_org_admin(state: &AppState, principal: &Principal, org_id: &str) -> Result<(), ApiError> {
    if !state.config_db.organization_exists(org_id).map_err(ApiError::from_db)? {
        return Err(ApiError::not_found("organization"));
    }
    let user = principal.user_id.to_string();
    if state.authz.is_org_admin(&user, org_id)? {
        return Ok(());
    }
    if state.authz.is_org_member(&user, org_id)? {
        Err(ApiError::Forbidden("datasource management requires the admin role".into()))
    } else {
        Err(ApiError::not_found("organization"))
    }
}

pub async fn create_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(org_id): Path<String>,
    Json(body): Json<DataSourceBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_org_admin(&state, &principal, &org_id)?;
    let (ds_type, auth_type) = validate(&body)?;

    let ds = DataSource {
        id: uuid::Uuid::new_v4().to_string(),
        organization_id: org_id,
        name: body.name.trim().to_string(),
        ds_type,
        url: body.url,
        auth_type,
        auth_config: body.auth_config,
        config: body.config,
        is_default: body.is_default,
        created_at: String::new(),
        updated_at: String::new(),
    };
    state.config_db.create_datasource(&ds).map_err(ApiError::from_db)?;
    let created = load_datasource(&state, &ds.id)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_datasources(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(org_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config_db.organization_exists(&org_id).map_err(ApiError::from_db)? {
        return Err(ApiError::not_found("organization"));
    }
    let user = principal.user_id.to_string();
    if !state.authz.is_org_member(&user, &org_id)? {
        return Err(ApiError::not_found("organization"));
    }
    let datasources = state.config_db.list_datasources(&org_id).map_err(ApiError::from_db)?;
    Ok(Json(serde_json::json!({ "datasources": datasources })))
}

pub async fn get_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    Ok(Json(ds))
}

pub async fn update_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(body): Json<DataSourceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = load_datasource(&state, &id)?;
    authorize(&state, &principal, &existing, Action::Administer)?;
    let (ds_type, auth_type) = validate(&body)?;

    let updated = DataSource {
        id: existing.id.clone(),
        organization_id: existing.organization_id.clone(),
        name: body.name.trim().to_string(),
        ds_type,
        url: body.url,
        auth_type,
        auth_config: body.auth_config,
        config: body.config,
        is_default: body.is_default,
        created_at: existing.created_at.clone(),
        updated_at: String::new(),
    };
    if !state.config_db.update_datasource(&updated).map_err(ApiError::from_db)? {
        return Err(ApiError::not_found("datasource"));
    }
    let reloaded = load_datasource(&state, &id)?;
    Ok(Json(reloaded))
}

pub async fn delete_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Administer)?;
    if !state.config_db.delete_datasource(&id).map_err(ApiError::from_db)? {
        return Err(ApiError::not_found("datasource"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_datasource(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ds = load_datasource(&state, &id)?;
    authorize(&state, &principal, &ds, Action::Read)?;
    let adapter = build_adapter(&ds, &state.http);
    adapter.test_connection().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

pub mod datasources;
pub mod health;
pub mod labels;
pub mod query;
pub mod stream;
pub mod traces;

use crate::AppState;
use crate::authn::Principal;
use crate::authz::{Action, ResourceType};
use crate::error::ApiError;
use crate::models::datasource::DataSource;

/// Load a datasource or fail with 404.
pub(crate) fn load_datasource(state: &AppState, id: &str) -> Result<DataSource, ApiError> {
    state
        .config_db
        .get_datasource(id)
        .map_err(ApiError::from_db)?
        .ok_or_else(|| ApiError::not_found("datasource"))
}

/// Authorise `principal` for `action` on a loaded datasource. Callers from
/// outside the owning org get 404 so existence is not leaked; members with
/// insufficient permission get 403.
pub(crate) fn authorize(
    state: &AppState,
    principal: &Principal,
    ds: &DataSource,
    action: Action,
) -> Result<(), ApiError> {
    let user = principal.user_id.to_string();
    if state
        .authz
        .can(&user, &ds.organization_id, ResourceType::Datasource, &ds.id, action)?
    {
        return Ok(());
    }
    if state.authz.is_org_member(&user, &ds.organization_id)? {
        Err(ApiError::Forbidden("insufficient permission for this datasource".into()))
    } else {
        Err(ApiError::not_found("datasource"))
    }
}

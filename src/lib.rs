pub mod adapters;
pub mod authn;
pub mod authz;
pub mod config;
pub mod config_db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod timeparse;

use std::sync::Arc;

use authz::Authz;
use config::GatewayConfig;
use config_db::ConfigDb;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub config_db: Arc<ConfigDb>,
    pub authz: Authz,
    pub http: reqwest::Client,
}

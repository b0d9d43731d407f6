use axum::{Router, middleware, routing::get, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use obsgate::AppState;
use obsgate::authn;
use obsgate::authz::Authz;
use obsgate::config::GatewayConfig;
use obsgate::config_db::ConfigDb;
use obsgate::handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("obsgate=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("OBSGATE_CONFIG").unwrap_or_else(|_| "./obsgate.toml".to_string());
    let config = GatewayConfig::load(&config_path)?.with_env_overrides();
    if config.auth.jwt_secret.is_empty() {
        anyhow::bail!("no JWT secret configured (set OBSGATE_JWT_SECRET or [auth].jwt_secret)");
    }

    let db_path = std::env::var("OBSGATE_DB").unwrap_or_else(|_| "./obsgate.db".to_string());
    let config_db = Arc::new(ConfigDb::open(&db_path)?);
    tracing::info!("config db opened at {db_path}");

    let state = AppState {
        config: Arc::new(config.clone()),
        config_db: config_db.clone(),
        authz: Authz::new(config_db),
        http: reqwest::Client::new(),
    };

    let gated = Router::new()
        // Datasource registry
        .route(
            "/api/orgs/{org_id}/datasources",
            get(handlers::datasources::list_datasources)
                .post(handlers::datasources::create_datasource),
        )
        .route(
            "/api/datasources/{id}",
            get(handlers::datasources::get_datasource)
                .put(handlers::datasources::update_datasource)
                .delete(handlers::datasources::delete_datasource),
        )
        .route(
            "/api/datasources/{id}/test",
            post(handlers::datasources::test_datasource),
        )
        // Query gateway
        .route("/api/datasources/{id}/query", post(handlers::query::query_datasource))
        .route("/api/datasources/{id}/stream", post(handlers::stream::stream_logs))
        .route("/api/datasources/{id}/labels", get(handlers::labels::list_labels))
        .route(
            "/api/datasources/{id}/labels/{name}/values",
            get(handlers::labels::list_label_values),
        )
        // Traces
        .route(
            "/api/datasources/{id}/traces/search",
            post(handlers::traces::search_traces),
        )
        .route(
            "/api/datasources/{id}/traces/services",
            get(handlers::traces::list_services),
        )
        .route(
            "/api/datasources/{id}/traces/{trace_id}",
            get(handlers::traces::get_trace),
        )
        .route(
            "/api/datasources/{id}/traces/{trace_id}/service-graph",
            get(handlers::traces::get_service_graph),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authn::require_auth));

    let app = Router::new()
        .route("/api/health", get(handlers::health::health))
        .merge(gated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    tracing::info!("obsgate listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

//! # Server Configuration
//!
//! Server setup for the integrations API: application state assembly, the
//! router with its auth boundary, and OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::broker::OAuthBroker;
use crate::config::AppConfig;
use crate::contracts::ContractRegistry;
use crate::exchange::ExchangeClient;
use crate::handlers;
use crate::store::DatabaseStore;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub broker: Arc<OAuthBroker>,
}

#[cfg(test)]
impl AppState {
    /// State over an in-memory store, for handler and middleware tests.
    pub fn for_tests(config: Arc<AppConfig>) -> Self {
        use crate::store::MemoryStore;

        let crypto_key = config.crypto_key().expect("test config carries a key");
        let broker = OAuthBroker::new(
            ContractRegistry::builtin().expect("builtin table is valid"),
            config.provider_env.clone(),
            crypto_key,
            ExchangeClient::new(),
            Arc::new(MemoryStore::new()),
            config.public_base_url.clone(),
        );

        Self {
            config,
            db: DatabaseConnection::default(),
            broker: Arc::new(broker),
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/connect/{tool}",
            post(handlers::connect::start_connection).delete(handlers::connections::disconnect),
        )
        .route("/connections", get(handlers::connections::get_status))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            crate::auth::auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        // The callback is authenticated by its signed state value, not a
        // bearer token; the provider is the caller here.
        .route(
            "/oauth/callback/{provider}",
            get(handlers::connect::oauth_callback),
        )
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Assembles the broker over the database store and serves the API.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let crypto_key = config.crypto_key()?;

    let store = Arc::new(DatabaseStore::new(Arc::new(db.clone())));
    let broker = OAuthBroker::new(
        ContractRegistry::builtin()?,
        config.provider_env.clone(),
        crypto_key,
        ExchangeClient::new(),
        store,
        config.public_base_url.clone(),
    );

    tracing::info!(
        available_tools = ?broker.available_tools(),
        "Provider availability resolved from environment"
    );

    let state = AppState {
        config: Arc::clone(&config),
        db,
        broker: Arc::new(broker),
    };
    let app = create_app(state);

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::connect::start_connection,
        crate::handlers::connect::oauth_callback,
        crate::handlers::connections::get_status,
        crate::handlers::connections::disconnect,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::connect::AuthorizeUrlResponse,
            crate::handlers::connect::ConnectionSummaryResponse,
            crate::handlers::connections::StatusResponse,
            crate::handlers::connections::ToolStatusResponse,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Skillmap Integrations API",
        description = "OAuth broker linking user accounts to third-party productivity tools",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

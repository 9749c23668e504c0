use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod services;
mod store;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};


pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub engine: Arc<workflows::WorkflowEngine>,
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Cadence Workflow Engine v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/events", handlers::event_routes())
        .nest("/api/v1/executions", handlers::execution_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let providers = services::ProviderRegistry::from_config(&config);
    if providers.is_empty() {
        tracing::warn!("No message providers configured; sends will be recorded as failed");
    }

    let pg_store = Arc::new(store::PgStore::new(db_pool.clone()));
    let engine = Arc::new(workflows::WorkflowEngine::new(
        store::Stores::shared(pg_store),
        providers,
    ));

    let mut scheduler = jobs::JobScheduler::new(engine.clone(), jobs::JobConfig::from_env()).await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        engine: engine.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!(addr = %config.server_addr, "Server running");

    axum::serve(listener, app_router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    engine.wait_idle().await;
    tracing::info!("In-flight enrollment runs finished");

    Ok(())
}

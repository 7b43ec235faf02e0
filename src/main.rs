mod aggregator;
mod broker;
mod cache;
mod cache_manager;
mod config;
mod db;
mod error;
mod handlers;
mod llm;
mod models;
mod orchestrator;
mod session;
mod storage;
mod ws;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};

use aggregator::{ContentAggregator, StubArxivResolver, StubPdfExtractor};
use broker::Broker;
use cache_manager::{CacheLifecycle, CacheManager};
use config::Config;
use llm::{HttpLlmCacheClient, LlmCacheClient};
use orchestrator::Orchestrator;
use session::SessionManager;
use storage::ObjectStorage;

/// Process-wide shared state. Every collaborator is constructed once here
/// and handed to handlers via axum's `State` extractor — no hidden
/// singletons (§9).
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub cache_manager: Arc<dyn CacheLifecycle>,
    pub session_manager: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub broker: Broker,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env().expect("invalid or missing configuration"));

    tracing::info!("Connecting to Postgres...");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    db::init_schema(&db_pool)
        .await
        .expect("Failed to initialize database schema");
    tracing::info!("Connected to Postgres");

    tracing::info!("Connecting to Redis...");
    let redis_client = redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .expect("Failed to connect to Redis");
    tracing::info!("Connected to Redis");

    tracing::info!(host = %config.llm_provider_host, "Using LLM provider");
    let llm: Arc<dyn LlmCacheClient> = Arc::new(HttpLlmCacheClient::new(config.llm_provider_host.clone()));

    let cache_manager: Arc<dyn CacheLifecycle> = Arc::new(CacheManager::new(
        db_pool.clone(),
        redis_conn,
        llm.clone(),
        config.clone(),
    ));

    let session_manager = Arc::new(SessionManager::new(cache_manager.clone(), llm, config.clone()));

    let aggregator = Arc::new(ContentAggregator::new(Arc::new(StubArxivResolver), Arc::new(StubPdfExtractor)));
    let storage: Arc<dyn ObjectStorage> = storage::arc_filesystem_storage(
        std::env::var("OBJECT_STORAGE_ROOT").unwrap_or_else(|_| "./data/blobs".to_string()),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        db_pool.clone(),
        aggregator,
        storage,
        cache_manager.clone(),
        session_manager.clone(),
        config.cache_ttl.as_secs(),
    ));

    let broker = Broker::new();

    let app_state = AppState {
        db: db_pool,
        cache_manager,
        session_manager: session_manager.clone(),
        orchestrator,
        broker,
        config,
    };

    tokio::spawn(session_manager.run_reaper());

    let app = Router::new()
        .route("/api/research/ws/:session_id", get(ws::ws_handler))
        .route("/api/research/sessions", post(handlers::start_session))
        .route("/api/research/sessions/:id", delete(handlers::terminate_session))
        .route("/api/research/sessions/:id/messages", get(handlers::list_messages))
        .route("/api/internal/topup", post(handlers::topup))
        .route("/health", get(handlers::health_check))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(app_state);

    tracing::info!("Listening on 0.0.0.0:3000");

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("Failed to bind to 0.0.0.0:3000");

    axum::serve(listener, app).await.expect("Server error");
}

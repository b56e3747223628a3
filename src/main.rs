use anyhow::Context;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_lead_broker::buyer_client::HttpBuyerClient;
use rust_lead_broker::config::Config;
use rust_lead_broker::handlers::{self, AppState};
use rust_lead_broker::registry::BuyerRegistry;
use rust_lead_broker::webhook::HmacSignatureVerifier;

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - The buyer registry (optionally seeded from a JSON file).
/// - The auction components and the background retry worker.
/// - HTTP routes and middleware (CORS, body limit, rate limiting).
///
/// It then starts the Axum server.
///
/// # Returns
///
/// * `anyhow::Result<()>` - Ok if the server runs successfully, or an error if initialization fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_lead_broker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let registry = match &config.buyers_config_path {
        Some(path) => BuyerRegistry::from_json_file(path)?,
        None => {
            tracing::warn!("BUYERS_CONFIG_PATH not set, starting with an empty buyer registry");
            BuyerRegistry::new()
        }
    };
    tracing::info!("Buyer registry ready with {} buyer(s)", registry.len());

    let transport = HttpBuyerClient::new().context("Failed to initialize buyer HTTP client")?;
    let verifier = HmacSignatureVerifier::new(
        config.webhook_secrets.clone(),
        config.engine.webhook_max_age_secs,
    );

    // Build application state
    let app_state = Arc::new(AppState::new(
        config.engine.clone(),
        Arc::new(registry),
        Arc::new(transport),
        Arc::new(verifier),
    ));

    // Deferred re-delivery runs for the lifetime of the process
    app_state
        .retries
        .clone()
        .spawn_worker(config.engine.retry_sweep_interval());
    tracing::info!(
        "Retry worker started (sweep every {}s)",
        config.engine.retry_sweep_interval_secs
    );

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        .route("/api/v1/auctions", post(handlers::run_auction))
        .route(
            "/api/v1/buyers/:buyer_id/preview/:kind",
            post(handlers::preview_payload),
        )
        .route("/api/v1/buyers/:buyer_id", put(handlers::upsert_buyer))
        .route("/api/v1/webhooks/:buyer_id", post(handlers::receive_webhook))
        .route("/api/v1/monitor/metrics", get(handlers::monitor_metrics))
        .route("/api/v1/monitor/alerts", get(handlers::monitor_alerts))
        .route("/api/v1/retries", get(handlers::pending_retries))
        .route("/api/v1/retries/dead-letters", get(handlers::dead_letters))
        .layer(
            ServiceBuilder::new()
                // Request size limit follows the outbound payload ceiling
                .layer(RequestBodyLimitLayer::new(config.engine.max_payload_bytes))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await?;

    Ok(())
}

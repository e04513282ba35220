use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use blob_transfer_function::adapters::azure::AzureStoreFactory;
use blob_transfer_function::adapters::client_cache::ClientCache;
use blob_transfer_function::config::HandlerConfig;
use blob_transfer_function::handlers::transfer::TransferExecutor;
use blob_transfer_function::handlers::trigger::handle_invocation;
use blob_transfer_function::runtime::credentials::EnvSnapshot;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Must match the function directory name so the host routes invocations here.
const FUNCTION_ROUTE: &str = "/processBlobUpload";

#[derive(Clone)]
struct AppState {
    source_cache: Arc<ClientCache>,
    executor: Arc<TransferExecutor>,
}

async fn process_blob_upload(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let response = handle_invocation(&event, &state.source_cache, &state.executor).await;
    let status = StatusCode::from_u16(response.status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(event = "signal_handler_failed", error = %error);
        std::future::pending::<()>().await;
    }
    info!(event = "handler_shutdown");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let env = EnvSnapshot::from_process();
    let config = HandlerConfig::from_env(&env)?;

    let factory = Arc::new(
        AzureStoreFactory::new(config.store_max_retries, config.upload_max_concurrency)
            .with_msi_endpoint(config.msi_endpoint.clone()),
    );
    let source_cache = Arc::new(ClientCache::new(
        config.connection_setting.clone(),
        config.source_container.clone(),
        env.clone(),
        factory.clone(),
    ));
    let destination_cache = Arc::new(ClientCache::new(
        config.connection_setting.clone(),
        config.destination_container.clone(),
        env,
        factory,
    ));
    let state = AppState {
        source_cache,
        executor: Arc::new(TransferExecutor::new(destination_cache)),
    };

    let app = Router::new()
        .route(FUNCTION_ROUTE, post(process_blob_upload))
        .with_state(state);

    let address = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(
        event = "handler_listening",
        address = %address,
        route = FUNCTION_ROUTE,
        connection_setting = %config.connection_setting,
        source_container = %config.source_container,
        destination_container = %config.destination_container
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

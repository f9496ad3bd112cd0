// Demo gateway: an axum server with the rate limit layer in front of every route
use axum::extract::Request;
use axum::routing::get;
use axum::{Json, Router};
use dotenv::dotenv;
use keyed_rate_limiter::config::{ServerConfig, StorageConfig};
use keyed_rate_limiter::storage::RedisStorage;
use keyed_rate_limiter::{
    build_limiter, init_logging, keys, EndpointConfig, MemoryStorage, RateLimitLayer, Store,
    WindowedStore,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const HEALTH_PATH: &str = "/health";

// Requests let through because the limiter failed
static FAIL_OPEN_COUNT: AtomicU64 = AtomicU64::new(0);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();

    let config = ServerConfig::load()?;
    info!(
        bind_addr = %config.bind_addr,
        algorithm = config.default_limit.name(),
        endpoints = config.endpoints.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn WindowedStore> = match &config.storage {
        StorageConfig::Memory(memory) => Arc::new(MemoryStorage::new(memory.clone())?),
        StorageConfig::Redis(redis) => {
            let storage = RedisStorage::new(redis.clone()).await?;
            storage.ping().await?;
            info!(url = %redis.url, "Connected to Redis");
            Arc::new(storage)
        }
    };

    let app = router(&config, Arc::clone(&store))?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Rate limiting gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    store.close().await?;
    info!("Rate limiting gateway stopped");
    Ok(())
}

fn router(
    config: &ServerConfig,
    store: Arc<dyn WindowedStore>,
) -> keyed_rate_limiter::Result<Router> {
    let default_limiter = build_limiter(&config.default_limit, Arc::clone(&store))?;

    let mut layer = RateLimitLayer::new(default_limiter, keys::from_source(&config.key))
        .skip_if(|req: &Request| req.uri().path() == HEALTH_PATH)
        .on_error(|_| {
            FAIL_OPEN_COUNT.fetch_add(1, Ordering::Relaxed);
        });

    for endpoint in &config.endpoints {
        let limiter = build_limiter(&endpoint.algorithm, Arc::clone(&store))?;
        let mut endpoint_config = EndpointConfig::new(endpoint.path.clone(), limiter);
        if let Some(key) = &endpoint.key {
            endpoint_config = endpoint_config.with_key_fn(keys::from_source(key));
        }
        info!(
            path = %endpoint.path,
            algorithm = endpoint.algorithm.name(),
            "Endpoint limiter configured"
        );
        layer = layer.endpoint(endpoint_config);
    }

    Ok(Router::new()
        .route("/", get(root))
        .route(HEALTH_PATH, get(health))
        .fallback(echo)
        .layer(layer))
}

async fn root() -> &'static str {
    "keyed rate limiter gateway"
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "fail_open_requests": FAIL_OPEN_COUNT.load(Ordering::Relaxed),
    }))
}

async fn echo(req: Request) -> Json<Value> {
    Json(json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

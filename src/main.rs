//! TUS Server
//!
//! A resumable upload server speaking TUS 1.0.0 with the Express and
//! CrossCheck extensions, backed by the filesystem, S3, GridFS or Redis.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tus_server::config::{Config, StorageBackend, StorageConfig};
use tus_server::routes;
use tus_server::state::AppState;
use tus_server::store::{
    FilesystemStore, KeyValueStore, MemoryKeyValue, ObjectStore, S3Client, UploadStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "tus_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting TUS Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("API path: {}", config.tus.api_path);
    tracing::info!("Max upload size: {} bytes", config.tus.max_size);

    let store = build_store(&config.storage).await?;
    tracing::info!("Storage backend: {}", store.kind().as_str());

    let state = AppState::new(config.clone(), store);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let app = routes::app(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    tracing::info!("TUS Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Construct the configured storage backend
///
/// Backends whose feature was not compiled in are rejected here, before the
/// server starts accepting requests.
async fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn UploadStore>> {
    let ttl = Duration::from_secs(config.redis.ttl_secs);

    let store: Arc<dyn UploadStore> = match config.backend {
        StorageBackend::Filesystem => {
            let store = FilesystemStore::new(&config.upload_dir).with_context(|| {
                format!("Upload directory {} must exist", config.upload_dir.display())
            })?;
            tracing::info!("Upload directory: {}", store.upload_dir().display());
            Arc::new(store)
        }
        StorageBackend::S3 => {
            tracing::info!("S3 endpoint: {}", config.s3.endpoint);
            tracing::info!("S3 bucket: {}", config.s3.bucket);
            let client = S3Client::new(&config.s3)
                .await
                .context("Failed to initialize S3 client")?;
            Arc::new(ObjectStore::new(client, config.s3.prefix.clone()))
        }
        StorageBackend::Memory => {
            tracing::warn!("In-memory storage: uploads are lost on restart");
            Arc::new(KeyValueStore::new(MemoryKeyValue::new(), &config.redis.key_prefix, ttl))
        }
        StorageBackend::Redis => redis_store(config, ttl).await?,
        StorageBackend::Mongodb => mongodb_store(config).await?,
    };
    Ok(store)
}

#[cfg(feature = "redis")]
async fn redis_store(config: &StorageConfig, ttl: Duration) -> anyhow::Result<Arc<dyn UploadStore>> {
    let client = tus_server::store::RedisClient::connect(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(KeyValueStore::new(client, &config.redis.key_prefix, ttl)))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_config: &StorageConfig, _ttl: Duration) -> anyhow::Result<Arc<dyn UploadStore>> {
    anyhow::bail!("STORAGE_BACKEND=redis requires building with the `redis` feature")
}

#[cfg(feature = "mongodb")]
async fn mongodb_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn UploadStore>> {
    let mongo = &config.mongodb;
    let bucket = tus_server::store::GridFsBucket::connect(&mongo.url, &mongo.database, &mongo.bucket)
        .await
        .context("Failed to connect to MongoDB")?;
    Ok(Arc::new(
        tus_server::store::DocumentStore::new(bucket).with_merge_on_complete(mongo.merge_on_complete),
    ))
}

#[cfg(not(feature = "mongodb"))]
async fn mongodb_store(_config: &StorageConfig) -> anyhow::Result<Arc<dyn UploadStore>> {
    anyhow::bail!("STORAGE_BACKEND=mongodb requires building with the `mongodb` feature")
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

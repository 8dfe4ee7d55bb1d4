//! HTTP range adapter
//!
//! Serves message files under `/{token}/{name}` with single-range support,
//! per-client admission control and token-addressed deletion.

mod admission;
mod error;
mod handlers;
mod range;

#[cfg(test)]
mod tests;

pub use admission::{AdmissionCounter, AdmissionPermit};
pub use range::{parse_range, ByteRange, Window};

use axum::{
    http::HeaderName,
    routing::get,
    Router,
};
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    locator::LocatorCodec,
    telegram::{ConnectionPool, MessageStore, PoolSettings, ProtocolClient, TelegramBackend},
    transfer::{TransferEngine, TransferSettings},
};

/// Request handling options taken from the configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_file_size: Option<u64>,
    pub trust_forwarded_headers: bool,
    pub show_index: bool,
    pub delete_key: Option<String>,
    pub delete_key_header: HeaderName,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let delete_key_header = HeaderName::from_bytes(config.security.delete_key_header.as_bytes())
            .map_err(|e| {
                Error::InvalidConfig(format!(
                    "Invalid delete key header '{}': {}",
                    config.security.delete_key_header, e
                ))
            })?;

        Ok(ServerSettings {
            max_file_size: config.server.max_file_size,
            trust_forwarded_headers: config.server.trust_forwarded_headers,
            show_index: config.server.show_index,
            delete_key: config.security.delete_key.clone(),
            delete_key_header,
        })
    }
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    codec: Arc<LocatorCodec>,
    backend: TelegramBackend,
    engine: Arc<TransferEngine>,
    admission: AdmissionCounter,
    settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn MessageStore>,
        engine: Arc<TransferEngine>,
    ) -> Result<Self> {
        Ok(AppState {
            codec: Arc::new(LocatorCodec::new(&config.security.token_secret)?),
            backend: TelegramBackend::new(store, &config.telegram),
            engine,
            admission: AdmissionCounter::new(config.server.request_limit),
            settings: Arc::new(ServerSettings::from_config(config)?),
        })
    }

    /// Per-client download counts
    pub fn admission(&self) -> &AdmissionCounter {
        &self.admission
    }
}

pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .route("/", get(handlers::index))
        .route(
            "/:token",
            get(handlers::bare_token).delete(handlers::delete_file),
        )
        .route(
            "/:token/:name",
            get(handlers::get_file).head(handlers::head_file),
        )
        .with_state(state)
}

/// Public URL of a file: `{prefix}/{token}/{name}`
pub fn public_link(prefix: &str, token: &str, name: &str) -> String {
    format!(
        "{}/{}/{}",
        prefix.trim_end_matches('/'),
        token,
        urlencoding::encode(name)
    )
}

/// Serve files until Ctrl-C
///
/// Entry point for the embedding application, which owns the MTProto
/// client and hands in both collaborators.
pub async fn serve(
    config: Config,
    store: Arc<dyn MessageStore>,
    client: Arc<dyn ProtocolClient>,
) -> Result<()> {
    config.validate()?;

    let bind_ip: IpAddr = config.server.host.parse().map_err(|e| {
        Error::InvalidConfig(format!("Invalid server.host '{}': {}", config.server.host, e))
    })?;
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.server.port)).await?;

    serve_on(listener, config, store, client, shutdown_signal()).await
}

/// Serve files on `listener` until `shutdown` completes
///
/// Owns the connection pool: it is created here and torn down after the
/// listener has shut down.
pub async fn serve_on<F>(
    listener: TcpListener,
    config: Config,
    store: Arc<dyn MessageStore>,
    client: Arc<dyn ProtocolClient>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let pool = ConnectionPool::init(client, PoolSettings::from(&config.pool));
    let engine = Arc::new(TransferEngine::new(
        pool.clone(),
        TransferSettings::from(&config.transfer),
    ));
    let app = build_app(AppState::new(&config, store, engine)?);

    let addr = listener.local_addr()?;
    info!(addr = %addr, prefix = %config.server.link_prefix(), "File server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    pool.teardown();
    served?;
    info!("File server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

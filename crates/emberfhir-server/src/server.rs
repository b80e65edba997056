//! Server assembly: state, router and the runnable server.

use crate::channels::ChannelDispatcher;
use crate::config::AppConfig;
use crate::formats::ServerCodec;
use crate::handlers;
use axum::Router;
use axum::routing::{get, post};
use emberfhir_store::TenantManager;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct AppState {
    pub manager: Arc<TenantManager>,
    pub codec: Arc<ServerCodec>,
}

/// Build the tenant manager and register every configured tenant. Must run
/// inside a tokio runtime (delivery workers are spawned per tenant).
pub fn build_state(config: &AppConfig) -> Result<Arc<AppState>, ServerError> {
    config.validate().map_err(ServerError::Config)?;

    let codec = Arc::new(ServerCodec);
    let chat = config.chat.is_configured().then(|| config.chat.clone());
    let dispatcher = Arc::new(ChannelDispatcher::new(chat));
    let manager = TenantManager::new(dispatcher, codec.clone());

    for tenant in &config.tenants {
        let settings = tenant.to_settings().map_err(ServerError::Config)?;
        manager
            .add_tenant(settings)
            .map_err(|e| ServerError::Config(e.to_string()))?;
    }

    Ok(Arc::new(AppState { manager, codec }))
}

/// The full route table.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{tenant}/metadata", get(handlers::metadata))
        .route(
            "/{tenant}/.well-known/smart-configuration",
            get(handlers::well_known),
        )
        .route("/{tenant}", post(handlers::system_bundle))
        .route(
            "/{tenant}/_search",
            get(handlers::system_search).post(handlers::system_search_post),
        )
        .route(
            "/{tenant}/{type_name}",
            get(handlers::type_search).post(handlers::type_create),
        )
        .route(
            "/{tenant}/{type_name}/_search",
            post(handlers::type_search_post),
        )
        .route(
            "/{tenant}/{type_name}/{id}",
            get(handlers::instance_read)
                .put(handlers::instance_update)
                .delete(handlers::instance_delete),
        )
        .route(
            "/{tenant}/{type_name}/{id}/{operation}",
            get(handlers::instance_operation).post(handlers::instance_operation),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The runnable server: binds, serves until ctrl-c, then drains.
pub struct EmberServer {
    config: AppConfig,
}

impl EmberServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.addr().map_err(ServerError::Config)?;
        let state = build_state(&self.config)?;
        state.manager.clone().start_timers();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(addr = %addr, tenants = state.manager.tenant_count(), "listening");

        let router = build_router(state.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;

        state.manager.shutdown().await;
        Ok(())
    }
}

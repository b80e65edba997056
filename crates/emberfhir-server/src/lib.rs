//! HTTP surface, configuration, CLI and notification channels.

pub mod channels;
pub mod cli;
pub mod config;
pub mod formats;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod smart;
pub mod xml;

pub use cli::{Args, build_config};
pub use config::{AppConfig, ChatConfig, TenantConfig};
pub use observability::init_tracing;
pub use server::{AppState, EmberServer, ServerError, build_router, build_state};

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod store;

use std::sync::Arc;

use auth::jwt::JwtVerifier;
use config::Config;
use gateway::hub::HubHandle;
use store::ChatStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub verifier: Arc<JwtVerifier>,
    pub config: Arc<Config>,
    pub hub: HubHandle,
}

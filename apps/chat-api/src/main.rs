use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_api::auth::jwt::JwtVerifier;
use chat_api::config::Config;
use chat_api::gateway::hub::Hub;
use chat_api::gateway::relay::{RedisBus, RelayBus};
use chat_api::store::{ChatStore, PgChatStore};
use chat_api::AppState;
use chat_common::SnowflakeGenerator;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let db = chat_api::db::pool::connect(&config.database_url).expect("invalid DATABASE_URL");
    let store: Arc<dyn ChatStore> = Arc::new(PgChatStore::new(
        db,
        SnowflakeGenerator::new(config.worker_id),
    ));

    let bus: Arc<dyn RelayBus> =
        Arc::new(RedisBus::open(&config.redis_url).expect("invalid REDIS_URL"));

    let hub = Hub::start(&config.hub, store.clone(), bus);

    tracing::info!(
        instance_id = %config.hub.instance_id,
        worker_id = config.worker_id,
        channel = %config.hub.relay_channel,
        "chat-api configured"
    );

    let state = AppState {
        store,
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        config: Arc::new(config),
        hub: hub.handle(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    // Upgraded sockets are closed as soon as the signal arrives so the
    // server drain does not wait on them.
    let sessions = hub.handle();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            sessions.close_sessions();
        })
        .await
        .expect("server error");

    hub.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

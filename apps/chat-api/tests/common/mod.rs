#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chat_api::auth::jwt::{issue_token, JwtVerifier};
use chat_api::config::{Config, HubConfig};
use chat_api::gateway::hub::Hub;
use chat_api::gateway::relay::MemoryBus;
use chat_api::store::{ChatStore, MemoryChatStore};
use chat_api::AppState;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";
pub const RELAY_CHANNEL: &str = "chat.messages";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One running instance: state, its in-memory collaborators, and the hub.
pub struct TestInstance {
    pub state: AppState,
    pub store: Arc<MemoryChatStore>,
    pub bus: Arc<MemoryBus>,
    pub hub: Hub,
}

pub fn test_config(instance_id: &str) -> Config {
    Config {
        database_url: "postgres://unused/chat_test".to_string(),
        redis_url: "redis://unused:6379/0".to_string(),
        jwt_secret: TEST_SECRET.to_string(),
        port: 0,
        worker_id: 0,
        hub: HubConfig {
            instance_id: instance_id.to_string(),
            relay_channel: RELAY_CHANNEL.to_string(),
            ..HubConfig::default()
        },
    }
}

/// Build an instance attached to `bus`. Several instances sharing one bus
/// behave like separate processes sharing Redis.
pub async fn test_instance(bus: Arc<MemoryBus>, instance_id: &str) -> TestInstance {
    test_instance_with(bus, test_config(instance_id)).await
}

pub async fn test_instance_with(bus: Arc<MemoryBus>, config: Config) -> TestInstance {
    let store = Arc::new(MemoryChatStore::new());
    let dyn_store: Arc<dyn ChatStore> = store.clone();
    let hub = Hub::start(&config.hub, dyn_store.clone(), bus.clone());

    let state = AppState {
        store: dyn_store,
        verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        config: Arc::new(config),
        hub: hub.handle(),
    };

    TestInstance {
        state,
        store,
        bus,
        hub,
    }
}

/// Build the full application router wired to a fresh instance.
pub async fn test_app() -> (Router, TestInstance) {
    let instance = test_instance(Arc::new(MemoryBus::new()), "hub_test").await;
    let app = chat_api::routes::router().with_state(instance.state.clone());
    (app, instance)
}

/// Start a real TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server(bus: Arc<MemoryBus>, instance_id: &str) -> (SocketAddr, TestInstance) {
    start_ws_server_with(bus, test_config(instance_id)).await
}

pub async fn start_ws_server_with(bus: Arc<MemoryBus>, config: Config) -> (SocketAddr, TestInstance) {
    let instance = test_instance_with(bus, config).await;
    let app = chat_api::routes::router().with_state(instance.state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, instance)
}

/// Wait until `n` relay subscriptions are open on the shared channel.
pub async fn wait_for_subscribers(bus: &MemoryBus, n: usize) {
    for _ in 0..100 {
        if bus.subscribers(RELAY_CHANNEL) >= n {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay subscribers never reached {n}");
}

pub fn token_for(user_id: &str, username: &str) -> String {
    issue_token(TEST_SECRET, user_id, username, chrono::Duration::minutes(5)).expect("mint token")
}

pub fn expired_token(user_id: &str, username: &str) -> String {
    issue_token(TEST_SECRET, user_id, username, chrono::Duration::minutes(-10))
        .expect("mint expired token")
}

pub fn auth_header(token: &str) -> String {
    format!("Bearer {token}")
}

/// Open a gateway connection using the `?token=` form.
pub async fn connect(addr: SocketAddr, token: &str) -> Ws {
    let url = format!("ws://{addr}/ws?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON envelope, skipping control frames. Panics after 5 s.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for envelope")
            .expect("stream ended")
            .expect("ws read error");

        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("envelope is JSON");
        }
    }
}

/// Next envelope matching `pred`, skipping everything else.
pub async fn next_matching(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let value = next_json(ws).await;
        if pred(&value) {
            return value;
        }
    }
}

/// Every envelope received within `window`.
pub async fn drain_for(ws: &mut Ws, window: Duration) -> Vec<Value> {
    let mut out = Vec::new();
    let deadline = time::Instant::now() + window;
    while let Ok(Some(Ok(msg))) = time::timeout_at(deadline, ws.next()).await {
        if let Message::Text(text) = msg {
            out.push(serde_json::from_str(&text).expect("envelope is JSON"));
        }
    }
    out
}

/// Connect and join a room, consuming the joiner's own join envelope.
pub async fn join(addr: SocketAddr, user_id: &str, username: &str, room: &str) -> Ws {
    let mut ws = connect(addr, &token_for(user_id, username)).await;
    send_json(&mut ws, serde_json::json!({ "type": "join", "room_id": room })).await;
    next_matching(&mut ws, |v| v["type"] == "join" && v["user_id"] == user_id).await;
    ws
}

/// Poll until the store has `n` saved messages.
pub async fn wait_for_saved(store: &MemoryChatStore, n: usize) {
    for _ in 0..100 {
        if store.saved_messages().len() >= n {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store never reached {n} saved messages");
}

//! WebSocket upgrade handler and the two per-connection loops.

use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use crate::auth::jwt::Identity;
use crate::auth::middleware::{bearer_token, AuthError};
use crate::config::HubConfig;
use crate::AppState;

use super::envelope::Envelope;
use super::error::GatewayError;
use super::hub::HubHandle;
use super::session::{Outbound, SessionHandle};

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Authenticate first; an unauthenticated request never gets upgraded,
/// whatever else is wrong with it.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let Some(token) = token else {
        return AuthError::missing().into_response();
    };
    let identity = match state.verifier.verify(token) {
        Ok(identity) => identity,
        Err(_) => return AuthError::invalid().into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let config = state.config.hub.clone();
    ws.max_message_size(config.max_message_bytes)
        .on_upgrade(move |socket| handle_connection(socket, hub, config, identity))
}

async fn handle_connection(socket: WebSocket, hub: HubHandle, config: HubConfig, identity: Identity) {
    let (session, mailbox) = hub.open_session(identity);
    if let Err(err) = hub.register(session.clone()).await {
        tracing::warn!(%err, "hub unavailable, dropping connection");
        return;
    }

    tracing::info!(
        conn_id = %session.conn_id(),
        user_id = %session.identity().user_id,
        "connection opened"
    );

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(send_loop(
        ws_tx,
        mailbox,
        session.clone(),
        config.ping_interval,
        config.write_wait,
    ));

    let reason = receive_loop(ws_rx, &session, &hub, config.pong_wait).await;
    session.close();
    if writer.await.is_err() {
        tracing::warn!(conn_id = %session.conn_id(), "send loop panicked");
    }

    // Only place a session is unregistered.
    if let Err(err) = hub.unregister(session.conn_id()).await {
        tracing::debug!(%err, "unregister after hub stopped");
    }
    session.mark_closed();

    tracing::info!(
        conn_id = %session.conn_id(),
        user_id = %session.identity().user_id,
        reason = %reason,
        "connection closed"
    );
}

/// Why the receive loop ended.
enum Exit {
    ClientClosed,
    Cancelled,
    Deadline,
    Error(GatewayError),
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::ClientClosed => f.write_str("client closed"),
            Exit::Cancelled => f.write_str("cancelled"),
            Exit::Deadline => f.write_str("read deadline expired"),
            Exit::Error(err) => write!(f, "{err}"),
        }
    }
}

async fn receive_loop(
    mut ws_rx: SplitStream<WebSocket>,
    session: &SessionHandle,
    hub: &HubHandle,
    pong_wait: Duration,
) -> Exit {
    let cancel = session.cancellation();

    loop {
        // Any frame, pongs included, restarts the deadline.
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,
            frame = time::timeout(pong_wait, ws_rx.next()) => frame,
        };

        let decoded = match frame {
            Err(_) => return Exit::Deadline,
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return Exit::ClientClosed,
            Ok(Some(Err(err))) => return Exit::Error(err.into()),
            Ok(Some(Ok(Message::Text(text)))) => Envelope::decode(text.as_str()),
            Ok(Some(Ok(Message::Binary(bytes)))) => Envelope::decode(&bytes),
            Ok(Some(Ok(_))) => continue,
        };

        let envelope = match decoded {
            Ok(envelope) => envelope.stamped(session.identity()),
            Err(err) => {
                tracing::warn!(
                    conn_id = %session.conn_id(),
                    err = %GatewayError::from(err),
                    "dropping frame"
                );
                continue;
            }
        };

        if let Err(err) = hub.dispatch(session.conn_id(), envelope).await {
            return Exit::Error(err);
        }
    }
}

async fn send_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<Outbound>,
    session: SessionHandle,
    ping_interval: Duration,
    write_wait: Duration,
) {
    let cancel = session.cancellation().clone();
    let mut ping = ping_timer(ping_interval);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            next = mailbox.recv() => match next {
                Some(first) => write_batch(&mut ws_tx, &mut mailbox, first, write_wait).await,
                None => break,
            },
            _ = ping.tick() => {
                with_deadline(write_wait, ws_tx.send(Message::Ping(Default::default()))).await
            }
        };

        if let Err(err) = result {
            tracing::debug!(conn_id = %session.conn_id(), %err, "write failed");
            session.close();
            return;
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: CLOSE_NORMAL,
        reason: "".into(),
    }));
    let _ = with_deadline(write_wait, ws_tx.send(close)).await;
}

/// First tick one period from now. A slow flush must not turn into a burst of
/// pings.
fn ping_timer(period: Duration) -> time::Interval {
    let mut ping = time::interval_at(time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping
}

/// Write `first` plus everything already queued behind it, then flush once.
async fn write_batch(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    mailbox: &mut mpsc::Receiver<Outbound>,
    first: Outbound,
    write_wait: Duration,
) -> Result<(), GatewayError> {
    let mut batch = vec![first];
    while let Ok(next) = mailbox.try_recv() {
        batch.push(next);
    }

    with_deadline(write_wait, async {
        for envelope in batch {
            let text = serde_json::to_string(envelope.as_ref()).map_err(axum::Error::new)?;
            ws_tx.feed(Message::Text(text.into())).await?;
        }
        ws_tx.flush().await
    })
    .await
}

async fn with_deadline<F>(limit: Duration, write: F) -> Result<(), GatewayError>
where
    F: std::future::Future<Output = Result<(), axum::Error>>,
{
    match time::timeout(limit, write).await {
        Ok(result) => result.map_err(GatewayError::from),
        Err(_) => Err(GatewayError::Transport("write deadline exceeded".into())),
    }
}

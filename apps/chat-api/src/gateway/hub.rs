//! The connection hub: a single control loop that owns the registry.
//!
//! Sessions, the relay subscriber, and HTTP handlers talk to it through a
//! cloneable [`HubHandle`]. Every mutation and every read of hub state happens
//! on the control loop task, one command at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::auth::jwt::Identity;
use crate::config::HubConfig;
use crate::store::ChatStore;

use super::envelope::Envelope;
use super::error::GatewayError;
use super::registry::Registry;
use super::relay::{RelayBridge, RelayBus};
use super::router::{BroadcastRouter, Origin};
use super::session::{ConnId, Outbound, SessionHandle};

const COMMAND_CAPACITY: usize = 1024;

/// How long shutdown waits for sessions to unregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct HubStats {
    /// Live sessions on this instance.
    pub sessions: usize,
    /// Rooms with at least one local member.
    pub rooms: usize,
}

enum HubCommand {
    Register(SessionHandle),
    Unregister(ConnId),
    Inbound { from: ConnId, envelope: Envelope },
    Relayed(Envelope),
    RoomMembers {
        room_id: String,
        reply: oneshot::Sender<Vec<Identity>>,
    },
    Stats(oneshot::Sender<HubStats>),
}

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    sessions: CancellationToken,
    mailbox_capacity: usize,
}

impl HubHandle {
    /// Create a session tied to the hub's shutdown signal. It still has to be
    /// registered.
    pub fn open_session(&self, identity: Identity) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        SessionHandle::new(identity, self.mailbox_capacity, self.sessions.child_token())
    }

    /// Start closing every session. Sessions opened afterwards close
    /// immediately.
    pub fn close_sessions(&self) {
        self.sessions.cancel();
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), GatewayError> {
        self.send(HubCommand::Register(session)).await
    }

    pub async fn unregister(&self, conn_id: &str) -> Result<(), GatewayError> {
        self.send(HubCommand::Unregister(conn_id.to_string())).await
    }

    /// Hand a stamped envelope from a local session to the router.
    pub async fn dispatch(&self, from: &str, envelope: Envelope) -> Result<(), GatewayError> {
        self.send(HubCommand::Inbound {
            from: from.to_string(),
            envelope,
        })
        .await
    }

    /// Hand an envelope received from another instance to the router.
    pub async fn relayed(&self, envelope: Envelope) -> Result<(), GatewayError> {
        self.send(HubCommand::Relayed(envelope)).await
    }

    /// Users currently connected to a room on this instance.
    pub async fn room_members(&self, room_id: &str) -> Result<Vec<Identity>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::RoomMembers {
            room_id: room_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| GatewayError::HubUnavailable)
    }

    pub async fn stats(&self) -> Result<HubStats, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats(reply)).await?;
        rx.await.map_err(|_| GatewayError::HubUnavailable)
    }

    async fn send(&self, command: HubCommand) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::HubUnavailable)
    }
}

/// Owner of the hub's background tasks.
pub struct Hub {
    handle: HubHandle,
    stop: CancellationToken,
    control: JoinHandle<()>,
    bridge: RelayBridge,
    clients: watch::Receiver<usize>,
}

impl Hub {
    /// Spawn the control loop and the relay bridge. Must run inside a Tokio
    /// runtime.
    pub fn start(config: &HubConfig, store: Arc<dyn ChatStore>, bus: Arc<dyn RelayBus>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = HubHandle {
            commands: tx,
            sessions: CancellationToken::new(),
            mailbox_capacity: config.mailbox_capacity,
        };

        let (bridge, publisher) = RelayBridge::start(bus, config, handle.clone());
        let (clients_tx, clients) = watch::channel(0);
        let stop = CancellationToken::new();

        let control = tokio::spawn(
            ControlLoop {
                registry: Registry::new(),
                router: BroadcastRouter::new(store, publisher),
                commands: rx,
                stop: stop.clone(),
                clients: clients_tx,
            }
            .run(),
        );

        tracing::info!(
            instance_id = %config.instance_id,
            channel = %config.relay_channel,
            "hub started"
        );

        Self {
            handle,
            stop,
            control,
            bridge,
            clients,
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Close every session, wait for them to unregister, then stop the
    /// control loop and the relay tasks.
    pub async fn shutdown(self) {
        tracing::info!("hub shutting down");
        self.handle.close_sessions();

        let mut clients = self.clients.clone();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, clients.wait_for(|n| *n == 0)).await;
        if drained.is_err() {
            tracing::warn!(
                remaining = *self.clients.borrow(),
                "sessions still registered after shutdown grace period"
            );
        }

        self.stop.cancel();
        if let Err(err) = self.control.await {
            tracing::error!(%err, "hub control loop panicked");
        }
        self.bridge.stop().await;
        tracing::info!("hub stopped");
    }
}

struct ControlLoop {
    registry: Registry,
    router: BroadcastRouter,
    commands: mpsc::Receiver<HubCommand>,
    stop: CancellationToken,
    clients: watch::Sender<usize>,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(c) => c,
                    None => break,
                },
            };
            self.handle(command);

            let count = self.registry.client_count();
            self.clients.send_if_modified(|n| {
                let changed = *n != count;
                *n = count;
                changed
            });
        }
        tracing::debug!(sessions = self.registry.client_count(), "hub control loop stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(session) => {
                let conn_id = session.conn_id().to_string();
                let user_id = session.identity().user_id.clone();
                if self.registry.register(session) {
                    tracing::info!(%conn_id, %user_id, "session registered");
                }
            }
            HubCommand::Unregister(conn_id) => {
                if let Some(departure) = self.registry.unregister(&conn_id) {
                    tracing::info!(
                        %conn_id,
                        user_id = %departure.session.identity().user_id,
                        rooms = departure.rooms.len(),
                        "session unregistered"
                    );
                    self.router.depart(&self.registry, departure);
                }
            }
            HubCommand::Inbound { from, envelope } => {
                self.router
                    .route(&mut self.registry, Origin::Local(from), envelope);
            }
            HubCommand::Relayed(envelope) => {
                self.router.route(&mut self.registry, Origin::Relay, envelope);
            }
            HubCommand::RoomMembers { room_id, reply } => {
                let _ = reply.send(self.registry.member_identities(&room_id));
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(HubStats {
                    sessions: self.registry.client_count(),
                    rooms: self.registry.room_count(),
                });
            }
        }
    }
}

//! Applies envelopes to the registry and fans them out to room members.

use std::sync::Arc;
use std::time::Duration;

use crate::store::ChatStore;

use super::envelope::{Envelope, EnvelopeKind};
use super::registry::{Departure, Registry};
use super::relay::RelayPublisher;
use super::session::ConnId;

/// Upper bound for a single `save_message` call.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where an envelope came from.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A session on this instance. State changes apply and the envelope is
    /// relayed to other instances.
    Local(ConnId),
    /// Another instance, via the bus. Fan-out only.
    Relay,
}

pub struct BroadcastRouter {
    store: Arc<dyn ChatStore>,
    relay: RelayPublisher,
}

impl BroadcastRouter {
    pub fn new(store: Arc<dyn ChatStore>, relay: RelayPublisher) -> Self {
        Self { store, relay }
    }

    pub fn route(&self, registry: &mut Registry, origin: Origin, envelope: Envelope) {
        if envelope.room_id.is_empty() {
            tracing::warn!(kind = envelope.kind.as_str(), "envelope without room_id dropped");
            return;
        }

        let conn_id = match origin {
            Origin::Relay => {
                if let EnvelopeKind::Unknown(kind) = &envelope.kind {
                    tracing::warn!(%kind, "unknown relayed envelope type dropped");
                    return;
                }
                self.fan_out(registry, Arc::new(envelope));
                return;
            }
            Origin::Local(conn_id) => conn_id,
        };

        if registry.session(&conn_id).is_none() {
            tracing::debug!(%conn_id, "envelope from unregistered connection dropped");
            return;
        }

        match &envelope.kind {
            EnvelopeKind::Join => {
                let added = registry.join_room(&conn_id, &envelope.room_id);
                tracing::info!(
                    %conn_id,
                    user_id = %envelope.user_id,
                    room_id = %envelope.room_id,
                    already_member = added == Some(false),
                    "joined room"
                );
            }
            EnvelopeKind::Leave => {
                registry.leave_room(&conn_id, &envelope.room_id);
                tracing::info!(
                    %conn_id,
                    user_id = %envelope.user_id,
                    room_id = %envelope.room_id,
                    "left room"
                );
            }
            EnvelopeKind::Message => self.persist(&envelope),
            EnvelopeKind::Unknown(kind) => {
                tracing::warn!(%conn_id, %kind, "unknown envelope type dropped");
                return;
            }
        }

        self.relay.publish(&envelope);
        self.fan_out(registry, Arc::new(envelope));
    }

    /// Tell the rooms a disconnected session was in that it is gone.
    pub fn depart(&self, registry: &Registry, departure: Departure) {
        let identity = departure.session.identity();
        for room_id in departure.rooms {
            let leave = Envelope::departure(room_id, identity);
            self.relay.publish(&leave);
            self.fan_out(registry, Arc::new(leave));
        }
    }

    /// Deliver to every current member. A member that cannot take the
    /// envelope is skipped (and closed, if its mailbox was full).
    fn fan_out(&self, registry: &Registry, envelope: Arc<Envelope>) -> usize {
        let mut delivered = 0;
        for member in registry.members(&envelope.room_id) {
            match member.enqueue(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(conn_id = %member.conn_id(), %err, "member skipped");
                }
            }
        }
        delivered
    }

    /// Save in the background. Delivery never waits for this and a failure
    /// only gets logged.
    fn persist(&self, envelope: &Envelope) {
        let store = self.store.clone();
        let envelope = envelope.clone();

        tokio::spawn(async move {
            let save = store.save_message(
                &envelope.room_id,
                &envelope.user_id,
                &envelope.username,
                &envelope.content,
            );
            match tokio::time::timeout(PERSIST_TIMEOUT, save).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(%err, room_id = %envelope.room_id, "failed to save message");
                }
                Err(_) => {
                    tracing::error!(room_id = %envelope.room_id, "saving message timed out");
                }
            }
        });
    }
}

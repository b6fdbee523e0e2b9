//! Hub state: live sessions and the room index.
//!
//! Owned by the hub control loop and never shared, so there is no lock here.
//! Invariant: a connection id is in `rooms[r]` iff `r` is in that client's
//! joined set, and no room entry is ever empty.

use std::collections::{HashMap, HashSet};

use crate::auth::jwt::Identity;

use super::session::{ConnId, SessionHandle};

struct Client {
    session: SessionHandle,
    rooms: HashSet<String>,
}

/// What is left of a session after it is unregistered.
#[derive(Debug)]
pub struct Departure {
    pub session: SessionHandle,
    /// Rooms the session was still in, sorted.
    pub rooms: Vec<String>,
}

#[derive(Default)]
pub struct Registry {
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session with no rooms. Returns `false` if it was already known.
    pub fn register(&mut self, session: SessionHandle) -> bool {
        let conn_id = session.conn_id().to_string();
        if self.clients.contains_key(&conn_id) {
            return false;
        }
        self.clients.insert(
            conn_id,
            Client {
                session,
                rooms: HashSet::new(),
            },
        );
        true
    }

    /// Remove a session and all of its memberships. `None` if it was not
    /// registered, which makes repeated unregisters harmless.
    pub fn unregister(&mut self, conn_id: &str) -> Option<Departure> {
        let client = self.clients.remove(conn_id)?;

        let mut rooms: Vec<String> = client.rooms.into_iter().collect();
        rooms.sort();
        for room_id in &rooms {
            self.remove_member(room_id, conn_id);
        }

        Some(Departure {
            session: client.session,
            rooms,
        })
    }

    /// `None` if the connection is unknown, otherwise whether this call added
    /// a new membership.
    pub fn join_room(&mut self, conn_id: &str, room_id: &str) -> Option<bool> {
        let client = self.clients.get_mut(conn_id)?;
        let added = client.rooms.insert(room_id.to_string());
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
        Some(added)
    }

    /// Returns whether a membership was removed.
    pub fn leave_room(&mut self, conn_id: &str, room_id: &str) -> bool {
        let Some(client) = self.clients.get_mut(conn_id) else {
            return false;
        };
        if !client.rooms.remove(room_id) {
            return false;
        }
        self.remove_member(room_id, conn_id);
        true
    }

    fn remove_member(&mut self, room_id: &str, conn_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    pub fn session(&self, conn_id: &str) -> Option<&SessionHandle> {
        self.clients.get(conn_id).map(|c| &c.session)
    }

    /// Snapshot of a room's members for fan-out.
    pub fn members(&self, room_id: &str) -> Vec<SessionHandle> {
        self.rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.clients.get(id))
            .map(|c| c.session.clone())
            .collect()
    }

    /// Identities present in a room, one entry per user, sorted by user id.
    pub fn member_identities(&self, room_id: &str) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut out: Vec<Identity> = self
            .members(room_id)
            .into_iter()
            .map(|s| s.identity().clone())
            .filter(|id| seen.insert(id.user_id.clone()))
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    pub fn rooms_of(&self, conn_id: &str) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .clients
            .get(conn_id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Check the membership invariant in both directions.
    pub fn is_consistent(&self) -> bool {
        let forward = self.clients.iter().all(|(conn_id, client)| {
            client
                .rooms
                .iter()
                .all(|r| self.rooms.get(r).is_some_and(|m| m.contains(conn_id)))
        });
        let backward = self.rooms.iter().all(|(room_id, members)| {
            !members.is_empty()
                && members
                    .iter()
                    .all(|id| self.clients.get(id).is_some_and(|c| c.rooms.contains(room_id)))
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn session(user: &str) -> SessionHandle {
        let (handle, _rx) = SessionHandle::new(
            Identity {
                user_id: format!("usr_{user}"),
                username: user.to_string(),
            },
            8,
            CancellationToken::new(),
        );
        handle
    }

    fn registered(registry: &mut Registry, user: &str) -> String {
        let s = session(user);
        let id = s.conn_id().to_string();
        assert!(registry.register(s));
        id
    }

    #[test]
    fn register_starts_with_no_rooms() {
        let mut registry = Registry::new();
        let a = registered(&mut registry, "alice");
        assert_eq!(registry.client_count(), 1);
        assert!(registry.rooms_of(&a).is_empty());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.is_consistent());
    }

    #[test]
    fn join_and_leave_keep_invariant_and_prune() {
        let mut registry = Registry::new();
        let a = registered(&mut registry, "alice");
        let b = registered(&mut registry, "bob");

        assert_eq!(registry.join_room(&a, "general"), Some(true));
        assert_eq!(registry.join_room(&b, "general"), Some(true));
        assert_eq!(registry.join_room(&a, "random"), Some(true));
        assert!(registry.is_consistent());
        assert_eq!(registry.members("general").len(), 2);

        assert!(registry.leave_room(&a, "random"));
        assert_eq!(registry.room_count(), 1, "empty room must be pruned");
        assert!(registry.is_consistent());

        assert!(!registry.leave_room(&a, "random"));
        assert!(!registry.leave_room(&a, "never-joined"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn join_twice_is_idempotent() {
        let mut registry = Registry::new();
        let a = registered(&mut registry, "alice");

        assert_eq!(registry.join_room(&a, "general"), Some(true));
        assert_eq!(registry.join_room(&a, "general"), Some(false));
        assert_eq!(registry.members("general").len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn join_unknown_connection_changes_nothing() {
        let mut registry = Registry::new();
        assert_eq!(registry.join_room("conn_missing", "general"), None);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn unregister_leaves_every_room() {
        let mut registry = Registry::new();
        let a = registered(&mut registry, "alice");
        let b = registered(&mut registry, "bob");
        registry.join_room(&a, "general");
        registry.join_room(&a, "random");
        registry.join_room(&b, "general");

        let departure = registry.unregister(&a).unwrap();
        assert_eq!(departure.rooms, ["general", "random"]);
        assert_eq!(departure.session.identity().username, "alice");

        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members("general").len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn unregister_twice_is_harmless() {
        let mut registry = Registry::new();
        let a = registered(&mut registry, "alice");
        registry.join_room(&a, "general");

        assert!(registry.unregister(&a).is_some());
        assert!(registry.unregister(&a).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn member_identities_dedupe_by_user() {
        let mut registry = Registry::new();
        let a1 = registered(&mut registry, "alice");
        let a2 = registered(&mut registry, "alice");
        let b = registered(&mut registry, "bob");
        for id in [&a1, &a2, &b] {
            registry.join_room(id, "general");
        }

        let names: Vec<_> = registry
            .member_identities("general")
            .into_iter()
            .map(|i| i.username)
            .collect();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let mut registry = Registry::new();
        let ids: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|u| registered(&mut registry, u))
            .collect();
        let rooms = ["r1", "r2", "r3"];

        for step in 0..60usize {
            let conn = &ids[step % ids.len()];
            let room = rooms[(step * 7) % rooms.len()];
            match step % 5 {
                0 | 1 => {
                    registry.join_room(conn, room);
                }
                2 => {
                    registry.leave_room(conn, room);
                }
                3 => {
                    if registry.unregister(conn).is_some() {
                        let (again, _rx) = SessionHandle::new(
                            Identity {
                                user_id: "usr_again".into(),
                                username: "again".into(),
                            },
                            1,
                            CancellationToken::new(),
                        );
                        registry.register(again);
                    }
                }
                _ => {}
            }
            assert!(registry.is_consistent(), "invariant broken at step {step}");
        }
    }
}

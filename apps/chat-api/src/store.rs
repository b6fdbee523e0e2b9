//! Durable room and message storage behind the `ChatStore` seam.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::AsyncConnection;
use parking_lot::Mutex;
use scoped_futures::ScopedFutureExt;

use chat_common::SnowflakeGenerator;

use crate::db::pool::DbPool;
use crate::db::schema::{messages, room_participants, rooms};
use crate::error::ApiError;
use crate::models::message::{Message, NewMessage};
use crate::models::room::{NewRoom, NewRoomParticipant, Room};

/// Default number of messages returned by [`ChatStore::room_history`].
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
/// Upper bound for a single history page.
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// Clamp a requested history size: anything outside `1..=100` falls back to
/// the default page size.
pub fn history_limit(requested: Option<i64>) -> i64 {
    match requested {
        Some(n) if (1..=MAX_HISTORY_LIMIT).contains(&n) => n,
        _ => DEFAULT_HISTORY_LIMIT,
    }
}

/// Abstraction over the durable chat log.
///
/// Backed by Postgres in production and an in-memory log in tests.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_room(
        &self,
        name: &str,
        description: Option<&str>,
        creator_id: &str,
    ) -> Result<Room, ApiError>;

    /// Rooms, newest first.
    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError>;

    /// Latest messages of a room, newest first. `limit` is clamped with
    /// [`history_limit`].
    async fn room_history(&self, room_id: &str, limit: i64) -> Result<Vec<Message>, ApiError>;

    async fn save_message(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        content: &str,
    ) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgChatStore {
    db: DbPool,
    snowflake: SnowflakeGenerator,
}

impl PgChatStore {
    pub fn new(db: DbPool, snowflake: SnowflakeGenerator) -> Self {
        Self { db, snowflake }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_room(
        &self,
        name: &str,
        description: Option<&str>,
        creator_id: &str,
    ) -> Result<Room, ApiError> {
        let mut conn = self.db.get().await?;

        let now = Utc::now();
        let room_id = chat_common::id::prefixed_ulid(chat_common::id::prefix::ROOM);

        // The creator becomes the first participant in the same transaction.
        let room = conn
            .transaction::<_, ApiError, _>(|conn| {
                async move {
                    let room: Room = diesel_async::RunQueryDsl::get_result(
                        diesel::insert_into(rooms::table)
                            .values(NewRoom {
                                id: &room_id,
                                name,
                                description,
                                created_by: creator_id,
                                created_at: now,
                                updated_at: now,
                            })
                            .returning(Room::as_returning()),
                        conn,
                    )
                    .await?;

                    diesel_async::RunQueryDsl::execute(
                        diesel::insert_into(room_participants::table)
                            .values(NewRoomParticipant {
                                room_id: &room_id,
                                user_id: creator_id,
                                joined_at: now,
                            })
                            .on_conflict_do_nothing(),
                        conn,
                    )
                    .await?;

                    Ok(room)
                }
                .scope_boxed()
            })
            .await?;

        Ok(room)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        let mut conn = self.db.get().await?;

        let list: Vec<Room> = diesel_async::RunQueryDsl::load(
            rooms::table
                .order(rooms::created_at.desc())
                .select(Room::as_select()),
            &mut conn,
        )
        .await?;

        Ok(list)
    }

    async fn room_history(&self, room_id: &str, limit: i64) -> Result<Vec<Message>, ApiError> {
        let mut conn = self.db.get().await?;

        let data: Vec<Message> = diesel_async::RunQueryDsl::load(
            messages::table
                .filter(messages::room_id.eq(room_id))
                .order(messages::id.desc())
                .limit(history_limit(Some(limit)))
                .select(Message::as_select()),
            &mut conn,
        )
        .await?;

        Ok(data)
    }

    async fn save_message(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        content: &str,
    ) -> Result<(), ApiError> {
        let mut conn = self.db.get().await?;

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(messages::table).values(NewMessage {
                id: self.snowflake.generate(),
                room_id,
                user_id,
                username,
                content,
                created_at: Utc::now(),
            }),
            &mut conn,
        )
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests / local runs without Postgres)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryLog {
    rooms: Vec<Room>,
    messages: Vec<Message>,
    fail_saves: bool,
}

/// A `ChatStore` that keeps everything in process memory.
pub struct MemoryChatStore {
    log: Mutex<MemoryLog>,
    snowflake: SnowflakeGenerator,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MemoryLog::default()),
            snowflake: SnowflakeGenerator::new(0),
        }
    }

    /// Make every subsequent `save_message` fail, to exercise the
    /// delivery-over-durability path.
    pub fn fail_saves(&self, fail: bool) {
        self.log.lock().fail_saves = fail;
    }

    /// All saved messages in insertion order.
    pub fn saved_messages(&self) -> Vec<Message> {
        self.log.lock().messages.clone()
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_room(
        &self,
        name: &str,
        description: Option<&str>,
        creator_id: &str,
    ) -> Result<Room, ApiError> {
        let now = Utc::now();
        let room = Room {
            id: chat_common::id::prefixed_ulid(chat_common::id::prefix::ROOM),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_by: creator_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.log.lock().rooms.push(room.clone());
        Ok(room)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, ApiError> {
        Ok(self.log.lock().rooms.iter().rev().cloned().collect())
    }

    async fn room_history(&self, room_id: &str, limit: i64) -> Result<Vec<Message>, ApiError> {
        let limit = history_limit(Some(limit)) as usize;
        Ok(self
            .log
            .lock()
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_message(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        content: &str,
    ) -> Result<(), ApiError> {
        let mut log = self.log.lock();
        if log.fail_saves {
            return Err(ApiError::unavailable("message store unavailable"));
        }
        log.messages.push(Message {
            id: self.snowflake.generate(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_defaults_and_clamps() {
        assert_eq!(history_limit(None), 50);
        assert_eq!(history_limit(Some(0)), 50);
        assert_eq!(history_limit(Some(-3)), 50);
        assert_eq!(history_limit(Some(101)), 50);
        assert_eq!(history_limit(Some(1)), 1);
        assert_eq!(history_limit(Some(100)), 100);
    }

    #[tokio::test]
    async fn memory_history_is_newest_first_and_scoped_to_room() {
        let store = MemoryChatStore::new();
        for i in 0..5 {
            store
                .save_message("general", "usr_1", "alice", &format!("m{i}"))
                .await
                .unwrap();
        }
        store.save_message("random", "usr_1", "alice", "elsewhere").await.unwrap();

        let history = store.room_history("general", 3).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn memory_rooms_list_newest_first() {
        let store = MemoryChatStore::new();
        store.create_room("first", None, "usr_1").await.unwrap();
        store.create_room("second", Some("desc"), "usr_1").await.unwrap();

        let rooms = store.list_rooms().await.unwrap();
        assert_eq!(rooms[0].name, "second");
        assert_eq!(rooms[0].description.as_deref(), Some("desc"));
        assert_eq!(rooms[1].name, "first");
    }
}
